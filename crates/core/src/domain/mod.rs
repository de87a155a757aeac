pub mod context;
pub mod job;
pub mod message;
pub mod turn;

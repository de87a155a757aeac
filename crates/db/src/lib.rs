pub mod connection;
pub mod migrations;
pub mod queue;
pub mod repositories;
pub mod store;

pub use connection::{connect, connect_from_config, connect_with_settings, ping, DbPool};
pub use queue::{JobQueue, QueueError};
pub use repositories::RepositoryError;
pub use store::{InMemoryStore, Store};

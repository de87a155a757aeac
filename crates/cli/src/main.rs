use std::process::ExitCode;

fn main() -> ExitCode {
    carelink_cli::run()
}

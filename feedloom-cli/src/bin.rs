//! Feed ingestion and fan-out pipeline
//!
//! Provides a cli for running the pipeline and for inspecting the
//! normalized configuration.
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    feedloom_cmd::run().await
}

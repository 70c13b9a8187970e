pub mod config;
pub mod error;
pub mod eventlog;
pub mod external;
pub mod matcher;
pub mod model;
pub mod orchestrator;
pub mod projector;
pub mod sharding;
pub mod verification;

pub use error::{FlotillaError, Result};
pub use orchestrator::{DebugSnapshot, Orchestrator};

/// Initialize logging for binaries embedding the orchestrator. Respects
/// `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

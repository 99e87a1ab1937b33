//! The monitor runtime: child process handle, interposing stream proxy,
//! event pipeline wiring, replay source, and the orchestrator that runs one
//! `monitor` invocation end to end.

pub mod child;
pub mod orchestrator;
pub mod pipeline;
pub mod proxy;
pub mod replay;

pub use child::ChildProcess;
pub use orchestrator::{
    MonitorOptions, MonitorOrchestrator, MonitoringResult, DEFAULT_SCOPE,
};
pub use pipeline::EventPipeline;
pub use proxy::{EventSink, NullSink, ProxyState, StreamProxy};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to spawn child: {0}")]
    Spawn(String),

    #[error("stream I/O error: {0}")]
    StreamIo(#[from] std::io::Error),

    #[error("proxy already started")]
    ProxyAlreadyStarted,

    #[error("replay error: {0}")]
    Replay(String),

    #[error(transparent)]
    Config(#[from] km_config::ConfigError),

    #[error(transparent)]
    Auth(#[from] km_auth::AuthError),

    #[error(transparent)]
    Session(#[from] km_core::SessionError),
}

mod events;
mod logs;
mod manager;
mod router;

pub use events::parse_sse_event;
pub use logs::{AgentLogBuffer, AgentLogLine, LogStream};
pub use manager::{AgentConfig, AgentLaunchSpec, AgentManager};
pub use router::{AgentDiscoverer, AgentRouter, StoreDiscoverer};

use cadre_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Liveness probe used by orphan reaping and stale-client cleanup.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        // Without a cheap probe, assume alive and let transport errors
        // surface instead.
        let _ = pid;
        true
    }
}

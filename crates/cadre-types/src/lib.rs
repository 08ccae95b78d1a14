mod agent;
mod bus;
mod conversation;
mod exec;
mod workspace;

pub use agent::*;
pub use bus::*;
pub use conversation::*;
pub use exec::*;
pub use workspace::*;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

mod config;
mod orchestration;
mod runs;

pub use config::{default_user_config_path, workspace_config_path, ConfigScope, ConfigStore};
pub use orchestration::{OrchestrationSnapshot, OrchestrationState, RunState};
pub use runs::{ActiveRun, RunRegistry};

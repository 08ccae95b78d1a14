mod cards;
mod danger;
mod proc;
mod runner;
mod template;

pub use cards::{CommandCardExecutor, RunOneOptions};
pub use danger::detect_dangerous;
pub use runner::{CodeRunner, CodeRunnerConfig};
pub use template::{render_template, shell_quote};

use cadre_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

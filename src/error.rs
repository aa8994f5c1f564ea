use crate::ledger::LedgerError;
use crate::prompt::PromptError;
use crate::protect::ProtectionError;
use crate::store::StateError;
use crate::system::ActionError;
use thiserror::Error;

/// Application-wide error types
///
/// Every variant is fatal to the running phase. The binary renders the
/// message on one line and exits nonzero.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("This command must be run from an elevated session")]
    Privilege,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Secret protection error: {0}")]
    Protection(#[from] ProtectionError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("System action failed: {0}")]
    SystemAction(#[from] ActionError),

    #[error("Input error: {0}")]
    Input(#[from] PromptError),
}

impl SetupError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

impl From<config::ConfigError> for SetupError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias using SetupError
pub type SetupResult<T> = Result<T, SetupError>;

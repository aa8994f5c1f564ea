pub mod config;
pub mod error;
pub mod ledger;
pub mod prompt;
pub mod protect;
pub mod store;
pub mod system;
pub mod workflow;

pub use config::AppConfig;
pub use error::{SetupError, SetupResult};
pub use workflow::{ClaimOutcome, ClaimRequest, FinishOutcome, FinishRequest, Provisioner};

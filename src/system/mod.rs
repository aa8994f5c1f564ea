//! Operating-system mutations used by the provisioning workflow.
//!
//! The workflow only talks to [`SystemActions`]; [`WindowsActions`] is the
//! production implementation.

pub mod windows;

pub use windows::WindowsActions;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// System action errors
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{action}: {detail}")]
    CommandFailed { action: &'static str, detail: String },

    #[error("{action}: could not start {program}: {source}")]
    Spawn {
        action: &'static str,
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Parameters for joining a domain.
pub struct DomainJoin<'a> {
    pub domain: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    /// Distinguished name of the OU to place the computer in
    pub ou_path: Option<&'a str>,
}

impl std::fmt::Debug for DomainJoin<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainJoin")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ou_path", &self.ou_path)
            .finish()
    }
}

/// One method per OS primitive. None of them restart the machine unless
/// asked to via [`SystemActions::restart`].
#[async_trait]
pub trait SystemActions: Send + Sync {
    /// Whether the current process holds administrative rights.
    async fn is_elevated(&self) -> Result<bool, ActionError>;

    async fn rename_computer(&self, new_name: &str) -> Result<(), ActionError>;

    /// Create the account if missing, reset its password otherwise, and make
    /// sure it is a member of the local Administrators group.
    async fn create_or_update_local_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), ActionError>;

    /// Remove a local account. A missing account is not an error.
    async fn remove_local_user(&self, username: &str) -> Result<(), ActionError>;

    async fn configure_autologon(&self, username: &str, password: &str)
        -> Result<(), ActionError>;

    /// Turn automatic logon off and delete the stored password.
    async fn clear_autologon(&self) -> Result<(), ActionError>;

    /// Join a domain without restarting.
    async fn join_domain(&self, request: &DomainJoin<'_>) -> Result<(), ActionError>;

    /// Register `command` to run once after the next interactive logon.
    async fn arm_continuation(&self, name: &str, command: &str) -> Result<(), ActionError>;

    async fn log_off(&self) -> Result<(), ActionError>;

    async fn restart(&self, delay: Duration) -> Result<(), ActionError>;
}

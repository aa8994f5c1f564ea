//! The two-phase provisioning state machine.
//!
//! [`Provisioner::claim`] runs in the temporary build account: it reserves a
//! hostname from the ledger, captures credentials, configures the machine,
//! persists a [`WorkflowState`](workstation_setup_types::WorkflowState) and
//! ends the session. After automatic logon the continuation re-invokes the
//! binary and [`Provisioner::finish`] picks the state up, joins the domain,
//! marks the ledger row and restarts.
//!
//! Both phases stop at the first failing step. Nothing already applied to the
//! machine is rolled back.

mod claim;
mod finish;
pub mod phase;

pub use phase::{ClaimPhase, FinishPhase};

use crate::config::WorkflowConfig;
use crate::error::{SetupError, SetupResult};
use crate::prompt::CredentialPrompt;
use crate::protect::SecretProtector;
use crate::store::StateStore;
use crate::system::SystemActions;
use std::path::{Path, PathBuf};
use workstation_setup_types::RowRef;

/// Note written to the ledger row once the machine has joined its domain.
pub const PROVENANCE_NOTE: &str = "Provisioned via computer-setup";

/// Inputs of the claim phase.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Domain key from the configuration document
    pub domain: String,
    /// Display name of the person the machine is for, e.g. "Jane Doe"
    pub assigned_user: String,
    /// Temporary account this phase runs under
    pub initial_user: String,
    /// Permanent local administrator to create
    pub local_admin: String,
    /// Configuration document handed to the continuation
    pub config_path: PathBuf,
    /// `--google-credentials` as given on the command line
    pub credentials_override: Option<PathBuf>,
    /// Executable the continuation re-invokes
    pub program: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub sequence: u32,
    pub hostname: String,
    pub row: RowRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishRequest {
    /// Restart once everything succeeded
    pub restart: bool,
}

impl Default for FinishRequest {
    fn default() -> Self {
        Self { restart: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOutcome {
    pub hostname: String,
    pub restarted: bool,
}

/// Drives both phases against injected collaborators.
pub struct Provisioner<'a> {
    actions: &'a dyn SystemActions,
    protector: &'a dyn SecretProtector,
    prompt: &'a dyn CredentialPrompt,
    store: &'a StateStore,
    settings: WorkflowConfig,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        actions: &'a dyn SystemActions,
        protector: &'a dyn SecretProtector,
        prompt: &'a dyn CredentialPrompt,
        store: &'a StateStore,
    ) -> Self {
        Self {
            actions,
            protector,
            prompt,
            store,
            settings: WorkflowConfig::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Fail with [`SetupError::Privilege`] unless running elevated.
    pub async fn ensure_elevated(&self) -> SetupResult<()> {
        if self.actions.is_elevated().await? {
            Ok(())
        } else {
            Err(SetupError::Privilege)
        }
    }
}

/// Command line registered to run once after the next logon.
pub fn continuation_command(
    program: &Path,
    state: &Path,
    config: &Path,
    credentials: Option<&Path>,
) -> String {
    let mut command = format!(
        "\"{}\" post-login --state \"{}\" --config \"{}\"",
        program.display(),
        state.display(),
        config.display()
    );
    if let Some(credentials) = credentials {
        command.push_str(&format!(" --google-credentials \"{}\"", credentials.display()));
    }
    command
}

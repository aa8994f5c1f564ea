//! Workflow snapshot handed from the claim phase to the post-login phase.

use crate::ledger::{LedgerLocation, RowRef, RowRefError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// Version tag written into every new state document.
pub const STATE_VERSION: u32 = 1;

/// Credentials carried across the restart.
///
/// Both passwords hold tokens produced by the secret protector, never
/// plaintext. The domain username is stored as typed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    pub local_admin_password: String,
    pub domain_username: String,
    pub domain_password: String,
}

impl Drop for Secrets {
    fn drop(&mut self) {
        self.local_admin_password.zeroize();
        self.domain_username.zeroize();
        self.domain_password.zeroize();
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("local_admin_password", &"<protected>")
            .field("domain_username", &self.domain_username)
            .field("domain_password", &"<protected>")
            .finish()
    }
}

/// Where the reservation made by the claim phase lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIdentity {
    pub sheet_id: String,
    pub worksheet: String,
    /// A1 range returned when the row was appended, e.g. `Devices!A5:G5`.
    pub row_reference: String,
}

impl LedgerIdentity {
    pub fn location(&self) -> LedgerLocation {
        LedgerLocation::new(&self.sheet_id, &self.worksheet)
    }

    pub fn row(&self) -> Result<RowRef, RowRefError> {
        self.row_reference.parse()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateValidationError {
    #[error("unsupported state version {0} (this build understands up to {STATE_VERSION})")]
    UnsupportedVersion(u32),

    #[error("state field '{0}' is empty")]
    EmptyField(&'static str),

    #[error(transparent)]
    RowReference(#[from] RowRefError),
}

/// Durable snapshot bridging the two provisioning phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub domain: String,
    pub assigned_user: String,
    pub computer_name: String,
    /// Temporary account the claim phase ran under.
    pub initial_user: String,
    /// Permanent local administrator configured for automatic logon.
    pub local_admin_user: String,
    pub ledger: LedgerIdentity,
    pub secrets: Secrets,
}

impl WorkflowState {
    /// Check that every field is usable. A state that fails here must not
    /// drive the post-login phase.
    pub fn validate(&self) -> Result<(), StateValidationError> {
        if self.version == 0 || self.version > STATE_VERSION {
            return Err(StateValidationError::UnsupportedVersion(self.version));
        }

        let required = [
            ("domain", &self.domain),
            ("assigned_user", &self.assigned_user),
            ("computer_name", &self.computer_name),
            ("initial_user", &self.initial_user),
            ("local_admin_user", &self.local_admin_user),
            ("ledger.sheet_id", &self.ledger.sheet_id),
            ("ledger.worksheet", &self.ledger.worksheet),
            ("ledger.row_reference", &self.ledger.row_reference),
            ("secrets.local_admin_password", &self.secrets.local_admin_password),
            ("secrets.domain_username", &self.secrets.domain_username),
            ("secrets.domain_password", &self.secrets.domain_password),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(StateValidationError::EmptyField(name));
            }
        }

        self.ledger.row()?;
        Ok(())
    }

    /// Whether the temporary account differs from the permanent admin.
    /// Windows account names compare case-insensitively.
    pub fn removes_initial_user(&self) -> bool {
        self.initial_user.to_lowercase() != self.local_admin_user.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkflowState {
        WorkflowState {
            version: STATE_VERSION,
            domain: "corp.example.com".to_string(),
            assigned_user: "jane-doe".to_string(),
            computer_name: "001-jane-doe".to_string(),
            initial_user: "build".to_string(),
            local_admin_user: "WorkstationAdmin".to_string(),
            ledger: LedgerIdentity {
                sheet_id: "sheet".to_string(),
                worksheet: "Devices".to_string(),
                row_reference: "Devices!A2:G2".to_string(),
            },
            secrets: Secrets {
                local_admin_password: "AQ==".to_string(),
                domain_username: "CORP\\joiner".to_string(),
                domain_password: "AQ==".to_string(),
            },
        }
    }

    #[test]
    fn valid_state_passes() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn bad_row_reference_fails() {
        let mut state = sample();
        state.ledger.row_reference = "Devices!A0:G0".to_string();
        assert!(matches!(
            state.validate(),
            Err(StateValidationError::RowReference(_))
        ));
    }

    #[test]
    fn empty_nested_secret_fails() {
        let mut state = sample();
        state.secrets.domain_password.clear();
        assert_eq!(
            state.validate(),
            Err(StateValidationError::EmptyField("secrets.domain_password"))
        );
    }

    #[test]
    fn future_version_is_rejected() {
        let mut state = sample();
        state.version = STATE_VERSION + 1;
        assert_eq!(
            state.validate(),
            Err(StateValidationError::UnsupportedVersion(STATE_VERSION + 1))
        );
    }

    #[test]
    fn initial_user_comparison_ignores_case() {
        let mut state = sample();
        assert!(state.removes_initial_user());
        state.initial_user = "workstationadmin".to_string();
        assert!(!state.removes_initial_user());
    }

    #[test]
    fn json_document_uses_field_names_and_tolerates_extras() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["ledger"]["row_reference"], "Devices!A2:G2");
        assert_eq!(json["secrets"]["domain_username"], "CORP\\joiner");

        let mut with_extra = json.clone();
        with_extra["added_later"] = serde_json::json!(true);
        let parsed: WorkflowState = serde_json::from_value(with_extra).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn debug_redacts_passwords() {
        let rendered = format!("{:?}", sample().secrets);
        assert!(!rendered.contains("AQ=="));
        assert!(rendered.contains("<protected>"));
    }
}

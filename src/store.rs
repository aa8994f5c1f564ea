//! Durable handoff of [`WorkflowState`] across the restart.
//!
//! One JSON document per machine. Writes go to a temporary file in the same
//! directory which is then renamed over the target, so a reader only ever
//! sees a complete document.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use workstation_setup_types::{StateValidationError, WorkflowState};

/// State store errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("no saved state at {0}")]
    Missing(PathBuf),

    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file {path} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: StateValidationError,
    },
}

/// File-backed store for one workflow snapshot.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, replacing any previous document atomically.
    pub fn save(&self, state: &WorkflowState) -> Result<PathBuf, StateError> {
        let io_error = |source: io::Error| StateError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(io_error)?;

        let data = serde_json::to_vec_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut temp = NamedTempFile::new_in(&parent).map_err(io_error)?;
        temp.write_all(&data).map_err(io_error)?;
        temp.as_file().sync_all().map_err(io_error)?;
        temp.persist(&self.path).map_err(|e| io_error(e.error))?;

        info!("State saved to {}", self.path.display());
        Ok(self.path.clone())
    }

    /// Read and validate the saved state.
    pub fn load(&self) -> Result<WorkflowState, StateError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::Missing(self.path.clone()))
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state: WorkflowState =
            serde_json::from_slice(&data).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        state.validate().map_err(|source| StateError::Invalid {
            path: self.path.clone(),
            source,
        })?;

        debug!("Loaded state for {} from {}", state.computer_name, self.path.display());
        Ok(state)
    }

    /// Remove the saved state. Removing an absent file succeeds.
    pub fn clear(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("State cleared at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workstation_setup_types::{LedgerIdentity, Secrets, STATE_VERSION};

    fn sample() -> WorkflowState {
        WorkflowState {
            version: STATE_VERSION,
            domain: "corp.example.com".to_string(),
            assigned_user: "jane-doe".to_string(),
            computer_name: "001-jane-doe".to_string(),
            initial_user: "build".to_string(),
            local_admin_user: "WorkstationAdmin".to_string(),
            ledger: LedgerIdentity {
                sheet_id: "X".to_string(),
                worksheet: "Devices".to_string(),
                row_reference: "Devices!A2:G2".to_string(),
            },
            secrets: Secrets {
                local_admin_password: "dG9rZW4x".to_string(),
                domain_username: "CORP\\joiner".to_string(),
                domain_password: "dG9rZW4y".to_string(),
            },
        }
    }

    #[test]
    fn save_creates_parents_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/deeper/state.json"));

        let written = store.save(&sample()).unwrap();
        assert_eq!(written, store.path());
        assert_eq!(store.load().unwrap(), sample());

        // Overwrite leaves exactly one document behind.
        let mut changed = sample();
        changed.computer_name = "002-jane-doe".to_string();
        store.save(&changed).unwrap();
        assert_eq!(store.load().unwrap().computer_name, "002-jane-doe");
        let entries = std::fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn clear_is_idempotent_and_load_after_clear_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store.clear().unwrap();
        store.save(&sample()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(matches!(store.load(), Err(StateError::Missing(_))));
    }

    #[test]
    fn load_rejects_corrupt_and_incomplete_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        std::fs::write(store.path(), "{ truncated").unwrap();
        assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));

        let mut json = serde_json::to_value(sample()).unwrap();
        json["secrets"].as_object_mut().unwrap().remove("domain_password");
        std::fs::write(store.path(), json.to_string()).unwrap();
        assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));

        let mut bad_row = sample();
        bad_row.ledger.row_reference = "Devices!A0:G0".to_string();
        std::fs::write(store.path(), serde_json::to_string(&bad_row).unwrap()).unwrap();
        assert!(matches!(store.load(), Err(StateError::Invalid { .. })));
    }
}

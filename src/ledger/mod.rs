//! Shared reservation ledger.
//!
//! The ledger is a spreadsheet tab shared by every machine provisioning
//! against a domain. [`LedgerClient`] implements reservation and status
//! updates on top of any [`LedgerBackend`]:
//!
//! - [`SheetsBackend`] talks to the Google Sheets v4 REST API using a
//!   service-account key
//! - [`MemoryLedger`] keeps tabs in memory, for tests and dry runs

pub mod auth;
pub mod client;
pub mod memory;
pub mod sheets;

pub use auth::{ServiceAccountKey, TokenSource};
pub use client::{AllocationStrategy, LedgerClient, Reservation};
pub use memory::MemoryLedger;
pub use sheets::SheetsBackend;

use async_trait::async_trait;
use thiserror::Error;
use workstation_setup_types::{Column, LedgerLocation, RowRef, RowRefError};

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("ledger tab {0} could not be opened")]
    TabNotFound(String),

    #[error("append to {location} did not report a usable row: {detail}")]
    Append { location: String, detail: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("credentials file {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("invalid ledger URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    RowReference(#[from] RowRefError),

    #[error("row reference points at tab '{found}' but the ledger tab is '{expected}'")]
    TabMismatch { expected: String, found: String },

    #[error("gave up reserving a sequence for {domain} after {attempts} conflicting attempts")]
    Contention { domain: String, attempts: u32 },

    #[error("ledger service unavailable")]
    Unavailable,
}

/// Row-level access to a ledger tab.
///
/// Row numbers are 1-based sheet rows; row 1 is the header.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Every row of the tab in order, header included. Element `i` is sheet
    /// row `i + 1`; blank rows are empty vectors.
    async fn read_rows(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError>;

    /// Overwrite consecutive cells of `row`, starting at column `first`.
    async fn write_cells(
        &self,
        location: &LedgerLocation,
        row: u32,
        first: Column,
        values: Vec<String>,
    ) -> Result<(), LedgerError>;

    /// Append a row below the last non-blank row and report where it landed.
    async fn append_row(
        &self,
        location: &LedgerLocation,
        values: Vec<String>,
    ) -> Result<RowRef, LedgerError>;
}

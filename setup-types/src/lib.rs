//! Data model shared by the workstation setup tool.
//!
//! Two families of types live here:
//!
//! - [`ledger`]: the fixed-shape reservation row kept in the shared ledger,
//!   its status values and the A1-style reference used to revisit a row.
//! - [`state`]: the workflow snapshot persisted between the claim phase and
//!   the post-login phase, including the protected secrets.

pub mod ledger;
pub mod state;

pub use ledger::{
    quote_sheet_name, Column, LedgerLocation, RecordError, ReservationRecord, ReservationStatus,
    RowRef, RowRefError, LEDGER_HEADERS,
};
pub use state::{LedgerIdentity, Secrets, StateValidationError, WorkflowState, STATE_VERSION};

//! Ledger row model.
//!
//! The ledger is a seven column table. The first row is the header and every
//! following row is one [`ReservationRecord`]. Columns beyond the seventh are
//! ignored on read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical header row, in column order.
pub const LEDGER_HEADERS: [&str; 7] = [
    "Domain",
    "Sequence",
    "Hostname",
    "AssignedUser",
    "Status",
    "Timestamp",
    "Notes",
];

/// One column of the canonical ledger schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Domain,
    Sequence,
    Hostname,
    AssignedUser,
    Status,
    Timestamp,
    Notes,
}

impl Column {
    pub const FIRST: Column = Column::Domain;
    pub const LAST: Column = Column::Notes;

    /// Zero-based position in a row.
    pub fn index(self) -> usize {
        match self {
            Self::Domain => 0,
            Self::Sequence => 1,
            Self::Hostname => 2,
            Self::AssignedUser => 3,
            Self::Status => 4,
            Self::Timestamp => 5,
            Self::Notes => 6,
        }
    }

    /// Column letter in A1 notation.
    pub fn letter(self) -> char {
        (b'A' + self.index() as u8) as char
    }
}

/// A ledger tab: spreadsheet id plus worksheet name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerLocation {
    pub sheet_id: String,
    pub worksheet: String,
}

impl LedgerLocation {
    pub fn new(sheet_id: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            worksheet: worksheet.into(),
        }
    }

    /// A1 range covering `first..=last` columns of a single row on this tab.
    pub fn row_range(&self, row: u32, first: Column, last: Column) -> String {
        format!(
            "{}!{}{row}:{}{row}",
            quote_sheet_name(&self.worksheet),
            first.letter(),
            last.letter()
        )
    }

    /// A1 range covering every canonical column of the tab.
    pub fn full_range(&self) -> String {
        format!(
            "{}!{}:{}",
            quote_sheet_name(&self.worksheet),
            Column::FIRST.letter(),
            Column::LAST.letter()
        )
    }
}

impl fmt::Display for LedgerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sheet_id, self.worksheet)
    }
}

/// Quote a worksheet name for use in an A1 range when it contains anything
/// other than ASCII letters, digits and underscores.
pub fn quote_sheet_name(name: &str) -> String {
    let plain = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

fn unquote_sheet_name(raw: &str) -> String {
    match raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'"),
        None => raw.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowRefError {
    #[error("row reference '{0}' is not an A1 range")]
    Malformed(String),

    #[error("row reference '{0}' does not name a positive row")]
    InvalidRow(String),
}

/// Reference to a single ledger row, captured when the row is appended.
///
/// Rendered as an A1 range spanning the canonical columns, e.g.
/// `Devices!A5:G5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowRef {
    pub worksheet: String,
    pub row: u32,
}

impl RowRef {
    pub fn new(worksheet: impl Into<String>, row: u32) -> Self {
        Self {
            worksheet: worksheet.into(),
            row,
        }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}!{}{}:{}{}",
            quote_sheet_name(&self.worksheet),
            Column::FIRST.letter(),
            self.row,
            Column::LAST.letter(),
            self.row
        )
    }
}

impl FromStr for RowRef {
    type Err = RowRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (sheet, range) = s
            .rsplit_once('!')
            .ok_or_else(|| RowRefError::Malformed(s.to_string()))?;
        if sheet.is_empty() {
            return Err(RowRefError::Malformed(s.to_string()));
        }

        let start = range.split(':').next().unwrap_or_default();
        let digits_at = start
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| RowRefError::InvalidRow(s.to_string()))?;
        let (letters, digits) = start.split_at(digits_at);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(RowRefError::Malformed(s.to_string()));
        }

        let row: u32 = digits
            .parse()
            .map_err(|_| RowRefError::InvalidRow(s.to_string()))?;
        if row == 0 {
            return Err(RowRefError::InvalidRow(s.to_string()));
        }

        Ok(Self {
            worksheet: unquote_sheet_name(sheet),
            row,
        })
    }
}

/// Lifecycle status of a reservation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Claimed by the first phase, domain join not yet done.
    Pending,
    /// Machine joined the domain.
    Joined,
    /// Provisioning failed after the reservation was made.
    Failed,
    /// Reservation lost an allocation race to an earlier row with the same
    /// sequence and was abandoned.
    Conflict,
    /// Anything else, usually a value typed into the sheet by hand.
    Other(String),
}

impl ReservationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Joined => "Joined",
            Self::Failed => "Failed",
            Self::Conflict => "Conflict",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for ReservationStatus {
    fn from(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "joined" => Self::Joined,
            "failed" => Self::Failed,
            "conflict" => Self::Conflict,
            _ => Self::Other(trimmed.to_string()),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("row has no domain")]
    MissingDomain,

    #[error("sequence '{0}' is not a nonnegative integer")]
    InvalidSequence(String),
}

/// One reservation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRecord {
    pub domain: String,
    pub sequence: u32,
    pub hostname: String,
    pub assigned_user: String,
    pub status: ReservationStatus,
    pub timestamp: String,
    pub notes: String,
}

impl ReservationRecord {
    /// A freshly claimed row.
    pub fn pending(
        domain: impl Into<String>,
        sequence: u32,
        hostname: impl Into<String>,
        assigned_user: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            sequence,
            hostname: hostname.into(),
            assigned_user: assigned_user.into(),
            status: ReservationStatus::Pending,
            timestamp: timestamp.into(),
            notes: String::new(),
        }
    }

    /// Cells in canonical column order.
    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.domain.clone(),
            self.sequence.to_string(),
            self.hostname.clone(),
            self.assigned_user.clone(),
            self.status.to_string(),
            self.timestamp.clone(),
            self.notes.clone(),
        ]
    }

    /// Parse a data row. Missing trailing cells read as empty, extra cells
    /// are ignored.
    pub fn from_cells(cells: &[String]) -> Result<Self, RecordError> {
        let cell = |column: Column| {
            cells
                .get(column.index())
                .map(|value| value.trim())
                .unwrap_or_default()
        };

        let domain = cell(Column::Domain);
        if domain.is_empty() {
            return Err(RecordError::MissingDomain);
        }

        let raw_sequence = cell(Column::Sequence);
        let sequence = raw_sequence
            .parse::<u32>()
            .map_err(|_| RecordError::InvalidSequence(raw_sequence.to_string()))?;

        Ok(Self {
            domain: domain.to_string(),
            sequence,
            hostname: cell(Column::Hostname).to_string(),
            assigned_user: cell(Column::AssignedUser).to_string(),
            status: ReservationStatus::from(cell(Column::Status)),
            timestamp: cell(Column::Timestamp).to_string(),
            notes: cell(Column::Notes).to_string(),
        })
    }

    /// Domain comparison used for sequence allocation.
    pub fn is_for_domain(&self, domain: &str) -> bool {
        self.domain.trim().eq_ignore_ascii_case(domain.trim())
    }
}

use super::{LedgerBackend, LedgerError};
use chrono::Utc;
use dashmap::DashSet;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use workstation_setup_types::{
    Column, LedgerLocation, ReservationRecord, ReservationStatus, RowRef, LEDGER_HEADERS,
};

/// How the next sequence number is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Read the maximum, append `max + 1`. Two machines racing can both
    /// claim the same number.
    Naive,
    /// Append, then re-read. If an earlier row already holds the same domain
    /// and sequence the new row is marked `Conflict` and allocation starts
    /// over. The lowest row for a (domain, sequence) pair always wins.
    #[default]
    Optimistic,
}

/// A claimed ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub sequence: u32,
    pub hostname: String,
    pub row: RowRef,
}

/// Reservation and status bookkeeping against a shared ledger.
pub struct LedgerClient {
    backend: Arc<dyn LedgerBackend>,
    strategy: AllocationStrategy,
    max_attempts: u32,
    /// Tabs whose header has already been checked by this client
    healed: DashSet<LedgerLocation>,
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("strategy", &self.strategy)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl LedgerClient {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self {
            backend,
            strategy: AllocationStrategy::default(),
            max_attempts: 5,
            healed: DashSet::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy, max_attempts: u32) -> Self {
        self.strategy = strategy;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Claim the next sequence number for `domain` and append a `Pending`
    /// row carrying the hostname built from it.
    pub async fn reserve_identity<F>(
        &self,
        domain: &str,
        assigned_user: &str,
        location: &LedgerLocation,
        hostname_factory: F,
    ) -> Result<Reservation, LedgerError>
    where
        F: Fn(u32) -> String + Send + Sync,
    {
        let rows = self.open(location).await?;

        match self.strategy {
            AllocationStrategy::Naive => {
                self.append_next(domain, assigned_user, location, &rows, &hostname_factory)
                    .await
            }
            AllocationStrategy::Optimistic => {
                let mut rows = rows;
                for attempt in 1..=self.max_attempts {
                    let claim = self
                        .append_next(domain, assigned_user, location, &rows, &hostname_factory)
                        .await?;

                    rows = self.backend.read_rows(location).await?;
                    match earlier_claim(&rows, domain, claim.sequence, claim.row.row) {
                        None => return Ok(claim),
                        Some(winner) => {
                            warn!(
                                "Sequence {} for {} was also claimed by row {}; abandoning row {} (attempt {}/{})",
                                claim.sequence, domain, winner, claim.row.row, attempt, self.max_attempts
                            );
                            self.write_status(
                                location,
                                claim.row.row,
                                ReservationStatus::Conflict,
                                &format!("superseded by row {}", winner),
                            )
                            .await?;
                            rows = self.backend.read_rows(location).await?;
                        }
                    }
                }
                Err(LedgerError::Contention {
                    domain: domain.to_string(),
                    attempts: self.max_attempts,
                })
            }
        }
    }

    /// Overwrite status, timestamp and notes of a reserved row.
    pub async fn finalize(
        &self,
        location: &LedgerLocation,
        row: &RowRef,
        status: ReservationStatus,
        notes: &str,
    ) -> Result<(), LedgerError> {
        if row.worksheet != location.worksheet {
            return Err(LedgerError::TabMismatch {
                expected: location.worksheet.clone(),
                found: row.worksheet.clone(),
            });
        }
        self.open(location).await?;
        self.write_status(location, row.row, status.clone(), notes)
            .await?;
        info!("Ledger row {} set to {}", row, status);
        Ok(())
    }

    /// Parsed data rows for one domain, skipping rows that do not parse.
    pub async fn records(
        &self,
        location: &LedgerLocation,
        domain: &str,
    ) -> Result<Vec<ReservationRecord>, LedgerError> {
        let rows = self.open(location).await?;
        Ok(data_records(&rows)
            .filter(|(_, record)| record.is_for_domain(domain))
            .map(|(_, record)| record)
            .collect())
    }

    /// Read the tab, repairing the header row the first time it is seen.
    async fn open(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError> {
        let mut rows = self.backend.read_rows(location).await?;
        if self.healed.contains(location) {
            return Ok(rows);
        }

        if !header_matches(rows.first()) {
            warn!("Ledger {} has a missing or malformed header; rewriting it", location);
            let header: Vec<String> = LEDGER_HEADERS.iter().map(|h| h.to_string()).collect();
            self.backend
                .write_cells(location, 1, Column::FIRST, header.clone())
                .await?;
            match rows.first_mut() {
                Some(first) => *first = header,
                None => rows.push(header),
            }
        }
        self.healed.insert(location.clone());
        Ok(rows)
    }

    async fn append_next<F>(
        &self,
        domain: &str,
        assigned_user: &str,
        location: &LedgerLocation,
        rows: &[Vec<String>],
        hostname_factory: &F,
    ) -> Result<Reservation, LedgerError>
    where
        F: Fn(u32) -> String + Send + Sync,
    {
        let sequence = next_sequence(rows, domain);
        let hostname = hostname_factory(sequence);
        let record = ReservationRecord::pending(
            domain,
            sequence,
            &hostname,
            assigned_user,
            Utc::now().to_rfc3339(),
        );

        let row = self.backend.append_row(location, record.to_cells()).await?;
        if row.row <= 1 {
            return Err(LedgerError::Append {
                location: location.to_string(),
                detail: format!("row {} overlaps the header", row),
            });
        }
        debug!("Appended {} sequence {} at {}", domain, sequence, row);
        Ok(Reservation {
            sequence,
            hostname,
            row,
        })
    }

    async fn write_status(
        &self,
        location: &LedgerLocation,
        row: u32,
        status: ReservationStatus,
        notes: &str,
    ) -> Result<(), LedgerError> {
        self.backend
            .write_cells(
                location,
                row,
                Column::Status,
                vec![
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                    notes.to_string(),
                ],
            )
            .await
    }
}

fn header_matches(first: Option<&Vec<String>>) -> bool {
    match first {
        Some(cells) if cells.len() >= LEDGER_HEADERS.len() => cells
            .iter()
            .zip(LEDGER_HEADERS.iter())
            .all(|(cell, expected)| cell.trim() == *expected),
        _ => false,
    }
}

/// Data rows with their 1-based sheet row number. Rows that do not parse are
/// skipped.
fn data_records(rows: &[Vec<String>]) -> impl Iterator<Item = (u32, ReservationRecord)> + '_ {
    rows.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
        .filter_map(|(index, cells)| match ReservationRecord::from_cells(cells) {
            Ok(record) => Some((index as u32 + 1, record)),
            Err(e) => {
                debug!("Skipping ledger row {}: {}", index + 1, e);
                None
            }
        })
}

/// `max + 1` over the domain's parsable rows; `1` for an empty domain.
fn next_sequence(rows: &[Vec<String>], domain: &str) -> u32 {
    data_records(rows)
        .filter(|(_, record)| record.is_for_domain(domain))
        .map(|(_, record)| record.sequence)
        .max()
        .unwrap_or(0)
        .saturating_add(1)
}

/// First row above `own_row` holding the same domain and sequence.
fn earlier_claim(rows: &[Vec<String>], domain: &str, sequence: u32, own_row: u32) -> Option<u32> {
    data_records(rows)
        .take_while(|(row, _)| *row < own_row)
        .find(|(_, record)| record.is_for_domain(domain) && record.sequence == sequence)
        .map(|(row, _)| row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_next_sequence_ignores_other_domains_and_bad_rows() {
        let table = vec![
            row(&LEDGER_HEADERS),
            row(&["corp", "3", "003-a"]),
            row(&["lab", "9", "009-b"]),
            row(&["CORP ", "5", "005-c"]),
            row(&["corp", "n/a", "x"]),
            row(&["corp", "", "y"]),
            row(&[]),
        ];
        assert_eq!(next_sequence(&table, "corp"), 6);
        assert_eq!(next_sequence(&table, "lab"), 10);
        assert_eq!(next_sequence(&table, "other"), 1);
    }

    #[test]
    fn test_header_only_counts_exact_canonical_columns() {
        assert!(header_matches(Some(&row(&LEDGER_HEADERS))));

        let mut extra = row(&LEDGER_HEADERS);
        extra.push("Comments".to_string());
        assert!(header_matches(Some(&extra)));

        assert!(!header_matches(None));
        assert!(!header_matches(Some(&row(&["Domain", "Sequence"]))));
        assert!(!header_matches(Some(&row(&["corp", "1", "001-a"]))));
    }

    #[test]
    fn test_earlier_claim_only_looks_above_own_row() {
        let table = vec![
            row(&LEDGER_HEADERS),
            row(&["corp", "1", "001-a"]),
            row(&["corp", "2", "002-b"]),
            row(&["corp", "2", "002-c"]),
        ];
        assert_eq!(earlier_claim(&table, "corp", 2, 4), Some(3));
        assert_eq!(earlier_claim(&table, "corp", 2, 3), None);
        assert_eq!(earlier_claim(&table, "lab", 2, 4), None);
    }
}

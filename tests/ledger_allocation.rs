//! Sequence allocation against a shared ledger.
//!
//! Every test runs the real `LedgerClient` against the in-memory backend, so
//! the row semantics (header row, append position, A1 row references) are the
//! same ones the Sheets backend reports.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use workstation_setup::config::AppConfig;
use workstation_setup::ledger::{
    AllocationStrategy, LedgerBackend, LedgerClient, LedgerError, MemoryLedger,
};
use workstation_setup_types::{
    Column, LedgerLocation, ReservationStatus, RowRef, LEDGER_HEADERS,
};

fn location() -> LedgerLocation {
    LedgerLocation::new("X", "Devices")
}

fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

fn header() -> Vec<String> {
    row(&LEDGER_HEADERS)
}

fn hostname(seq: u32) -> String {
    format!("{:03}-test", seq)
}

#[tokio::test]
async fn sequential_reservations_are_gapless() {
    let backend = Arc::new(MemoryLedger::new().with_tab(&location()));
    let client = LedgerClient::new(backend.clone());

    let mut sequences = Vec::new();
    for _ in 0..5 {
        let reservation = client
            .reserve_identity("corp.example.com", "test", &location(), hostname)
            .await
            .unwrap();
        sequences.push(reservation.sequence);
    }
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    let rows = backend.rows(&location()).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[5][Column::Hostname.index()], "005-test");
    assert_eq!(rows[5][Column::Status.index()], "Pending");
}

#[tokio::test]
async fn domains_keep_separate_counters() {
    let backend = Arc::new(MemoryLedger::new().with_tab(&location()));
    let client = LedgerClient::new(backend);

    for _ in 0..3 {
        client
            .reserve_identity("corp.example.com", "a", &location(), hostname)
            .await
            .unwrap();
    }
    let lab = client
        .reserve_identity("lab.example.com", "b", &location(), hostname)
        .await
        .unwrap();
    assert_eq!(lab.sequence, 1);

    let corp = client
        .reserve_identity("CORP.example.com", "c", &location(), hostname)
        .await
        .unwrap();
    assert_eq!(corp.sequence, 4);
}

#[tokio::test]
async fn malformed_rows_do_not_stop_allocation() {
    let backend = Arc::new(MemoryLedger::new().with_rows(
        &location(),
        vec![
            header(),
            row(&["corp", "7", "007-a", "a", "Joined", "", ""]),
            row(&["corp", "seven", "x", "x", "Pending", "", ""]),
            row(&["corp", "-3", "y"]),
            row(&["corp"]),
            row(&["", "99"]),
            Vec::new(),
        ],
    ));
    let client = LedgerClient::new(backend.clone());

    let reservation = client
        .reserve_identity("corp", "b", &location(), hostname)
        .await
        .unwrap();
    assert_eq!(reservation.sequence, 8);
    // Trailing blank row is reused by the append.
    assert_eq!(reservation.row, RowRef::new("Devices", 7));
}

#[tokio::test]
async fn missing_header_is_written_before_the_first_row() {
    let backend = Arc::new(MemoryLedger::new().with_tab(&location()));
    let client = LedgerClient::new(backend.clone());

    let reservation = client
        .reserve_identity("corp", "a", &location(), hostname)
        .await
        .unwrap();
    assert_eq!(reservation.row.row, 2);

    let rows = backend.rows(&location()).unwrap();
    assert_eq!(rows[0], header());
    assert_eq!(rows[1][Column::Domain.index()], "corp");
}

#[tokio::test]
async fn wrong_header_is_replaced() {
    let backend = Arc::new(
        MemoryLedger::new().with_rows(&location(), vec![row(&["Machine", "Number"])]),
    );
    let client = LedgerClient::new(backend.clone());

    client
        .reserve_identity("corp", "a", &location(), hostname)
        .await
        .unwrap();
    assert_eq!(backend.rows(&location()).unwrap()[0], header());
}

#[tokio::test]
async fn unknown_tab_is_a_ledger_error() {
    let client = LedgerClient::new(Arc::new(MemoryLedger::new()));
    let result = client
        .reserve_identity("corp", "a", &location(), hostname)
        .await;
    assert!(matches!(result, Err(LedgerError::TabNotFound(_))));
}

#[tokio::test]
async fn jane_doe_gets_the_first_hostname() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"domains": {"corp.example.com": {"sheet_id": "X", "hostname_template": "{seq:03d}-{user}"}}}"#,
    )
    .unwrap();
    let config = AppConfig::load(&path).unwrap();
    let domain = config.domain("corp.example.com").unwrap();
    let slug = workstation_setup::config::slugify_user("Jane Doe");

    let ledger_location = LedgerLocation::new(&domain.sheet_id, &domain.worksheet);
    let backend = Arc::new(MemoryLedger::new().with_tab(&ledger_location));
    let client = LedgerClient::new(backend);

    let reservation = client
        .reserve_identity(&domain.name, &slug, &ledger_location, |seq| {
            domain.build_hostname(seq, &slug)
        })
        .await
        .unwrap();
    assert_eq!(reservation.sequence, 1);
    assert_eq!(reservation.hostname, "001-jane-doe");
    assert_eq!(reservation.row.to_string(), "Devices!A2:G2");
}

#[tokio::test]
async fn finalize_overwrites_status_timestamp_and_notes() {
    let backend = Arc::new(MemoryLedger::new().with_tab(&location()));
    let client = LedgerClient::new(backend.clone());
    let reservation = client
        .reserve_identity("corp", "a", &location(), hostname)
        .await
        .unwrap();

    client
        .finalize(
            &location(),
            &reservation.row,
            ReservationStatus::Joined,
            "Provisioned via computer-setup",
        )
        .await
        .unwrap();

    let records = client.records(&location(), "corp").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ReservationStatus::Joined);
    assert_eq!(records[0].notes, "Provisioned via computer-setup");
    assert_eq!(records[0].hostname, "001-test");

    let other_tab = RowRef::new("Archive", 2);
    assert!(matches!(
        client
            .finalize(&location(), &other_tab, ReservationStatus::Joined, "")
            .await,
        Err(LedgerError::TabMismatch { .. })
    ));
}

/// Holds the first two reads until both have been issued, so two clients
/// compute their next sequence from the same snapshot.
struct LockstepReads {
    inner: MemoryLedger,
    barrier: Barrier,
    reads: AtomicUsize,
}

impl LockstepReads {
    fn new(inner: MemoryLedger) -> Self {
        Self {
            inner,
            barrier: Barrier::new(2),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LedgerBackend for LockstepReads {
    async fn read_rows(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError> {
        let rows = self.inner.read_rows(location).await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        Ok(rows)
    }

    async fn write_cells(
        &self,
        location: &LedgerLocation,
        row: u32,
        first: Column,
        values: Vec<String>,
    ) -> Result<(), LedgerError> {
        self.inner.write_cells(location, row, first, values).await
    }

    async fn append_row(
        &self,
        location: &LedgerLocation,
        values: Vec<String>,
    ) -> Result<RowRef, LedgerError> {
        self.inner.append_row(location, values).await
    }
}

async fn race(strategy: AllocationStrategy) -> (Vec<u32>, Vec<Vec<String>>) {
    let backend = Arc::new(LockstepReads::new(
        MemoryLedger::new().with_rows(&location(), vec![header()]),
    ));
    let first = LedgerClient::new(backend.clone()).with_strategy(strategy, 5);
    let second = LedgerClient::new(backend.clone()).with_strategy(strategy, 5);

    let loc = location();
    let (a, b) = tokio::join!(
        first.reserve_identity("corp", "a", &loc, hostname),
        second.reserve_identity("corp", "b", &loc, hostname),
    );
    let mut sequences = vec![a.unwrap().sequence, b.unwrap().sequence];
    sequences.sort_unstable();
    (sequences, backend.inner.rows(&location()).unwrap())
}

#[tokio::test]
async fn naive_allocation_can_hand_out_duplicates() {
    let (sequences, rows) = race(AllocationStrategy::Naive).await;
    assert_eq!(sequences, vec![1, 1]);
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn optimistic_allocation_resolves_the_race() {
    let (sequences, rows) = race(AllocationStrategy::Optimistic).await;
    assert_eq!(sequences, vec![1, 2]);

    let conflicts: Vec<&Vec<String>> = rows
        .iter()
        .filter(|cells| {
            cells.get(Column::Status.index()).map(String::as_str) == Some("Conflict")
        })
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0][Column::Notes.index()], "superseded by row 2");

    let winners: BTreeSet<&str> = rows
        .iter()
        .skip(1)
        .filter(|cells| cells[Column::Status.index()] == "Pending")
        .map(|cells| cells[Column::Sequence.index()].as_str())
        .collect();
    assert_eq!(winners, BTreeSet::from(["1", "2"]));
}

/// Another machine always appends the same claim just before ours.
struct AlwaysBeaten {
    inner: MemoryLedger,
}

#[async_trait]
impl LedgerBackend for AlwaysBeaten {
    async fn read_rows(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError> {
        self.inner.read_rows(location).await
    }

    async fn write_cells(
        &self,
        location: &LedgerLocation,
        row: u32,
        first: Column,
        values: Vec<String>,
    ) -> Result<(), LedgerError> {
        self.inner.write_cells(location, row, first, values).await
    }

    async fn append_row(
        &self,
        location: &LedgerLocation,
        values: Vec<String>,
    ) -> Result<RowRef, LedgerError> {
        self.inner.append_row(location, values.clone()).await?;
        self.inner.append_row(location, values).await
    }
}

#[tokio::test]
async fn optimistic_allocation_gives_up_under_constant_contention() {
    let backend = Arc::new(AlwaysBeaten {
        inner: MemoryLedger::new().with_rows(&location(), vec![header()]),
    });
    let client = LedgerClient::new(backend.clone()).with_strategy(AllocationStrategy::Optimistic, 3);

    let result = client
        .reserve_identity("corp", "a", &location(), hostname)
        .await;
    assert!(matches!(
        result,
        Err(LedgerError::Contention { attempts: 3, .. })
    ));

    // Each lost round left a competitor row and one abandoned row.
    let rows = backend.inner.rows(&location()).unwrap();
    assert_eq!(rows.len(), 1 + 3 * 2);
    let abandoned = rows
        .iter()
        .filter(|cells| cells[Column::Status.index()] == "Conflict")
        .count();
    assert_eq!(abandoned, 3);
}

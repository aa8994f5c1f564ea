use super::{LedgerBackend, LedgerError};
use async_trait::async_trait;
use dashmap::DashMap;
use workstation_setup_types::{Column, LedgerLocation, RowRef};

/// In-memory ledger with the same row semantics as a spreadsheet tab.
///
/// Tabs must be created before use; reading an unknown tab fails the way an
/// unopenable sheet does.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tabs: DashMap<LedgerLocation, Vec<Vec<String>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty tab (no header).
    pub fn with_tab(self, location: &LedgerLocation) -> Self {
        self.tabs.insert(location.clone(), Vec::new());
        self
    }

    /// Create a tab holding `rows` verbatim.
    pub fn with_rows(self, location: &LedgerLocation, rows: Vec<Vec<String>>) -> Self {
        self.tabs.insert(location.clone(), rows);
        self
    }

    /// Snapshot of a tab's rows.
    pub fn rows(&self, location: &LedgerLocation) -> Option<Vec<Vec<String>>> {
        self.tabs.get(location).map(|rows| rows.clone())
    }
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn read_rows(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError> {
        self.rows(location)
            .ok_or_else(|| LedgerError::TabNotFound(location.to_string()))
    }

    async fn write_cells(
        &self,
        location: &LedgerLocation,
        row: u32,
        first: Column,
        values: Vec<String>,
    ) -> Result<(), LedgerError> {
        let mut tab = self
            .tabs
            .get_mut(location)
            .ok_or_else(|| LedgerError::TabNotFound(location.to_string()))?;

        let index = row.checked_sub(1).ok_or_else(|| LedgerError::Api {
            status: 400,
            body: "row numbers start at 1".to_string(),
        })? as usize;
        if tab.len() <= index {
            tab.resize(index + 1, Vec::new());
        }

        let cells = &mut tab[index];
        let end = first.index() + values.len();
        if cells.len() < end {
            cells.resize(end, String::new());
        }
        for (offset, value) in values.into_iter().enumerate() {
            cells[first.index() + offset] = value;
        }
        Ok(())
    }

    async fn append_row(
        &self,
        location: &LedgerLocation,
        values: Vec<String>,
    ) -> Result<RowRef, LedgerError> {
        let mut tab = self
            .tabs
            .get_mut(location)
            .ok_or_else(|| LedgerError::TabNotFound(location.to_string()))?;

        while tab.last().is_some_and(|row| is_blank(row)) {
            tab.pop();
        }
        tab.push(values);
        Ok(RowRef::new(&location.worksheet, tab.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> LedgerLocation {
        LedgerLocation::new("sheet", "Devices")
    }

    #[tokio::test]
    async fn test_unknown_tab_is_not_found() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.read_rows(&location()).await,
            Err(LedgerError::TabNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_skips_trailing_blank_rows() {
        let ledger = MemoryLedger::new().with_rows(
            &location(),
            vec![vec!["h".to_string()], vec![], vec![String::new()]],
        );
        let row = ledger
            .append_row(&location(), vec!["a".to_string()])
            .await
            .unwrap();
        assert_eq!(row, RowRef::new("Devices", 2));
        assert_eq!(ledger.rows(&location()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_cells_extends_rows() {
        let ledger = MemoryLedger::new().with_tab(&location());
        ledger
            .write_cells(&location(), 3, Column::Status, vec!["Joined".to_string()])
            .await
            .unwrap();
        let rows = ledger.rows(&location()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][Column::Status.index()], "Joined");
        assert!(rows[2][..Column::Status.index()].iter().all(String::is_empty));
    }
}

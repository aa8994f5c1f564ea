use super::auth::{ServiceAccountKey, TokenSource};
use super::{LedgerBackend, LedgerError};
use crate::config::LedgerConfig;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use workstation_setup_types::{quote_sheet_name, Column, LedgerLocation, RowRef};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Request/response body for `spreadsheets.values`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    major_dimension: Option<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    #[serde(default)]
    updated_range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppendValuesResponse {
    #[serde(default)]
    updates: Option<UpdateValuesResponse>,
}

/// Whether a request may be replayed after an ambiguous failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads and absolute overwrites
    Safe,
    /// Appends: only replay when the server said it did nothing
    RejectedOnly,
}

/// [`LedgerBackend`] over the Google Sheets v4 REST API
pub struct SheetsBackend {
    http: Client,
    base_url: String,
    tokens: TokenSource,
    max_retries: u32,
}

impl std::fmt::Debug for SheetsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetsBackend")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl SheetsBackend {
    /// Create a backend authenticated with the service-account key at
    /// `credentials`.
    pub fn new(credentials: &Path, config: &LedgerConfig) -> Result<Self, LedgerError> {
        let key = ServiceAccountKey::from_file(credentials)?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            tokens: TokenSource::new(http.clone(), key),
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    fn values_url(&self, sheet_id: &str, range: &str, suffix: &str) -> Result<Url, LedgerError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| LedgerError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| LedgerError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["spreadsheets", sheet_id, "values"])
            .push(&format!("{}{}", range, suffix));
        Ok(url)
    }

    /// Send with bearer auth, retrying transient failures
    async fn send_with_retry<T, F>(&self, what: &str, replay: Replay, build: F) -> Result<T, LedgerError>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                warn!(
                    "Retrying {} (attempt {}/{}), waiting {:?}",
                    what, attempt, self.max_retries, delay
                );
                sleep(delay).await;
            }

            let token = self.tokens.access_token().await?;
            match build(&token).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(LedgerError::Http);
                    }

                    let mut body = response.text().await.unwrap_or_default();
                    body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
                    error!("{} failed with status {}: {}", what, status, body);
                    let failure = LedgerError::Api {
                        status: status.as_u16(),
                        body,
                    };

                    if status == StatusCode::UNAUTHORIZED {
                        self.tokens.invalidate().await;
                        last_error = Some(failure);
                    } else if status == StatusCode::TOO_MANY_REQUESTS
                        || (status.is_server_error() && replay == Replay::Safe)
                    {
                        last_error = Some(failure);
                    } else {
                        return Err(failure);
                    }
                }
                Err(e) => {
                    error!("{} request failed: {}", what, e);
                    if replay == Replay::RejectedOnly {
                        return Err(LedgerError::Http(e));
                    }
                    last_error = Some(LedgerError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or(LedgerError::Unavailable))
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Row number of the top-left cell of an A1 range such as `Devices!A3:G9`.
fn start_row(range: &str) -> Option<u32> {
    let cells = range.rsplit_once('!').map_or(range, |(_, cells)| cells);
    let start = cells.split(':').next()?;
    start
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

fn rows_from_value_range(values: ValueRange) -> Vec<Vec<String>> {
    let offset = values
        .range
        .as_deref()
        .and_then(start_row)
        .map_or(0, |row| row.saturating_sub(1) as usize);

    let mut rows = vec![Vec::new(); offset];
    rows.extend(
        values
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect()),
    );
    rows
}

fn row_from_append(
    location: &LedgerLocation,
    response: AppendValuesResponse,
) -> Result<RowRef, LedgerError> {
    let updated = response
        .updates
        .and_then(|u| u.updated_range)
        .ok_or_else(|| LedgerError::Append {
            location: location.to_string(),
            detail: "response has no updatedRange".to_string(),
        })?;

    let parsed: RowRef = updated.parse().map_err(|e| LedgerError::Append {
        location: location.to_string(),
        detail: format!("{}", e),
    })?;
    // Sheets echoes the tab name; keep the configured spelling.
    Ok(RowRef::new(&location.worksheet, parsed.row))
}

#[async_trait]
impl LedgerBackend for SheetsBackend {
    async fn read_rows(&self, location: &LedgerLocation) -> Result<Vec<Vec<String>>, LedgerError> {
        let url = self.values_url(&location.sheet_id, &location.full_range(), "")?;
        debug!("Reading ledger {}", location);

        let values: ValueRange = self
            .send_with_retry("ledger read", Replay::Safe, |token| {
                self.http
                    .get(url.clone())
                    .bearer_auth(token)
                    .query(&[("majorDimension", "ROWS")])
            })
            .await
            .map_err(|e| match e {
                LedgerError::Api { status: 404, .. } | LedgerError::Api { status: 400, .. } => {
                    LedgerError::TabNotFound(location.to_string())
                }
                other => other,
            })?;

        Ok(rows_from_value_range(values))
    }

    async fn write_cells(
        &self,
        location: &LedgerLocation,
        row: u32,
        first: Column,
        values: Vec<String>,
    ) -> Result<(), LedgerError> {
        let last_index = first.index() + values.len().saturating_sub(1);
        let last = (b'A' + last_index as u8) as char;
        let range = format!(
            "{}!{}{row}:{}{row}",
            quote_sheet_name(&location.worksheet),
            first.letter(),
            last
        );
        let url = self.values_url(&location.sheet_id, &range, "")?;
        let body = ValueRange {
            range: Some(range.clone()),
            major_dimension: Some("ROWS".to_string()),
            values: vec![values.into_iter().map(serde_json::Value::String).collect()],
        };

        let _: UpdateValuesResponse = self
            .send_with_retry("ledger update", Replay::Safe, |token| {
                self.http
                    .put(url.clone())
                    .bearer_auth(token)
                    .query(&[("valueInputOption", "RAW")])
                    .json(&body)
            })
            .await?;
        debug!("Wrote {}", range);
        Ok(())
    }

    async fn append_row(
        &self,
        location: &LedgerLocation,
        values: Vec<String>,
    ) -> Result<RowRef, LedgerError> {
        let url = self.values_url(&location.sheet_id, &location.full_range(), ":append")?;
        let body = ValueRange {
            range: None,
            major_dimension: Some("ROWS".to_string()),
            values: vec![values.into_iter().map(serde_json::Value::String).collect()],
        };

        let response: AppendValuesResponse = self
            .send_with_retry("ledger append", Replay::RejectedOnly, |token| {
                self.http
                    .post(url.clone())
                    .bearer_auth(token)
                    .query(&[
                        ("valueInputOption", "RAW"),
                        ("insertDataOption", "INSERT_ROWS"),
                    ])
                    .json(&body)
            })
            .await?;

        row_from_append(location, response)
    }
}

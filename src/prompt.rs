//! Interactive credential capture.
//!
//! The workflow asks for passwords through [`CredentialPrompt`] so that the
//! terminal can be replaced by scripted input in tests.

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Attempts allowed for a required, non-secret answer.
pub const MAX_LINE_ATTEMPTS: u32 = 3;

/// Prompt errors
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("input closed while waiting for {0}")]
    Closed(String),

    #[error("could not read {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("{what} must not be empty (gave up after {attempts} attempts)")]
    Empty { what: String, attempts: u32 },
}

/// Source of interactive answers.
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Read a value without echoing it.
    async fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>, PromptError>;

    /// Read one visible line, without its line terminator.
    async fn read_line(&self, prompt: &str) -> Result<String, PromptError>;

    /// Show an informational message.
    async fn notify(&self, message: &str);
}

/// Ask for a new password twice until both entries match and are non-empty.
pub async fn capture_new_password(
    prompt: &dyn CredentialPrompt,
    label: &str,
) -> Result<Zeroizing<String>, PromptError> {
    loop {
        let first = prompt.read_secret(&format!("Enter {}: ", label)).await?;
        if first.is_empty() {
            prompt.notify("Password cannot be empty.").await;
            continue;
        }
        let second = prompt.read_secret(&format!("Confirm {}: ", label)).await?;
        if *first != *second {
            prompt.notify("Passwords do not match. Try again.").await;
            continue;
        }
        return Ok(first);
    }
}

/// Ask for a password once, repeating only while the entry is empty.
pub async fn capture_password(
    prompt: &dyn CredentialPrompt,
    label: &str,
) -> Result<Zeroizing<String>, PromptError> {
    loop {
        let value = prompt.read_secret(&format!("Enter {}: ", label)).await?;
        if !value.is_empty() {
            return Ok(value);
        }
        prompt.notify("Password cannot be empty.").await;
    }
}

/// Ask for a required line, giving up after [`MAX_LINE_ATTEMPTS`] empty
/// answers.
pub async fn capture_required_line(
    prompt: &dyn CredentialPrompt,
    label: &str,
) -> Result<String, PromptError> {
    for attempt in 1..=MAX_LINE_ATTEMPTS {
        let value = prompt.read_line(&format!("Enter {}: ", label)).await?;
        let value = value.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        debug!("Empty {} (attempt {}/{})", label, attempt, MAX_LINE_ATTEMPTS);
        prompt.notify(&format!("{} cannot be empty.", label)).await;
    }
    Err(PromptError::Empty {
        what: label.to_string(),
        attempts: MAX_LINE_ATTEMPTS,
    })
}

/// Prompts on the controlling terminal. Secrets are read with echo disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    pub fn new() -> Self {
        Self
    }
}

fn read_stdin_line(prompt: &str) -> Result<String, PromptError> {
    let io_error = |source| PromptError::Io {
        what: prompt.trim().trim_end_matches(':').to_string(),
        source,
    };
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt).map_err(io_error)?;
    stderr.flush().map_err(io_error)?;

    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line).map_err(io_error)?;
    if read == 0 {
        return Err(PromptError::Closed(prompt.trim().to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[async_trait]
impl CredentialPrompt for TerminalPrompt {
    async fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>, PromptError> {
        let owned = prompt.to_string();
        let what = prompt.trim().trim_end_matches(':').to_string();
        tokio::task::spawn_blocking(move || rpassword::prompt_password_stderr(&owned))
            .await
            .map_err(|e| PromptError::Io {
                what: what.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
            .map(Zeroizing::new)
            .map_err(|source| match source.kind() {
                io::ErrorKind::UnexpectedEof => PromptError::Closed(what.clone()),
                _ => PromptError::Io { what, source },
            })
    }

    async fn read_line(&self, prompt: &str) -> Result<String, PromptError> {
        let owned = prompt.to_string();
        tokio::task::spawn_blocking(move || read_stdin_line(&owned))
            .await
            .map_err(|e| PromptError::Io {
                what: prompt.trim().to_string(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
    }

    async fn notify(&self, message: &str) {
        eprintln!("{}", message);
    }
}

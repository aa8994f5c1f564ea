use crate::error::{SetupError, SetupResult};
use crate::ledger::AllocationStrategy;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Ledger transport and allocation settings
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// How sequence numbers are allocated against the shared ledger
    #[serde(default)]
    pub allocation: AllocationStrategy,
    /// Lost allocation rounds tolerated before giving up
    #[serde(default = "default_max_reserve_attempts")]
    pub max_reserve_attempts: u32,
    /// Retries for transient HTTP failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_max_reserve_attempts() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_api_base_url() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            allocation: AllocationStrategy::default(),
            max_reserve_attempts: default_max_reserve_attempts(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            api_base_url: default_api_base_url(),
        }
    }
}

/// Settings for the restart boundary between the two phases
#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// Delay handed to the final restart
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// Name under which the one-shot continuation is registered
    #[serde(default = "default_continuation_name")]
    pub continuation_name: String,
}

fn default_restart_delay_secs() -> u64 {
    10
}

fn default_continuation_name() -> String {
    "ComputerSetupPostLogin".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            restart_delay_secs: default_restart_delay_secs(),
            continuation_name: default_continuation_name(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDomain {
    sheet_id: String,
    #[serde(default = "default_worksheet")]
    worksheet: String,
    #[serde(default = "default_hostname_template")]
    hostname_template: String,
    #[serde(default)]
    ou_path: Option<String>,
}

fn default_worksheet() -> String {
    "Devices".to_string()
}

fn default_hostname_template() -> String {
    "{seq:03d}-{user}".to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    google_credentials: Option<PathBuf>,
    #[serde(default)]
    domains: HashMap<String, RawDomain>,
    #[serde(default)]
    ledger: LedgerConfig,
    #[serde(default)]
    workflow: WorkflowConfig,
}

/// One provisioning target domain
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    pub sheet_id: String,
    pub worksheet: String,
    pub hostname_template: HostnameTemplate,
    pub ou_path: Option<String>,
}

impl DomainConfig {
    pub fn build_hostname(&self, seq: u32, user_slug: &str) -> String {
        self.hostname_template.render(seq, user_slug)
    }
}

/// Root application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub google_credentials: Option<PathBuf>,
    /// Keyed by lower-cased domain name
    pub domains: HashMap<String, DomainConfig>,
    pub ledger: LedgerConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Load configuration from the JSON document at `path`, overlaid by
    /// environment variables (prefix: WORKSTATION_SETUP_).
    pub fn load(path: &Path) -> SetupResult<Self> {
        if !path.exists() {
            return Err(SetupError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let raw: RawConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(true))
            // e.g., WORKSTATION_SETUP_GOOGLE_CREDENTIALS, WORKSTATION_SETUP_LEDGER__MAX_RETRIES
            .add_source(
                Environment::with_prefix("WORKSTATION_SETUP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> SetupResult<Self> {
        let mut domains = HashMap::with_capacity(raw.domains.len());
        for (name, value) in raw.domains {
            if value.sheet_id.trim().is_empty() {
                return Err(SetupError::config(format!(
                    "Domain '{}' has an empty sheet_id",
                    name
                )));
            }
            let hostname_template = value.hostname_template.parse().map_err(
                |e: TemplateError| {
                    SetupError::config(format!("Domain '{}' hostname_template: {}", name, e))
                },
            )?;
            domains.insert(
                name.to_lowercase(),
                DomainConfig {
                    name,
                    sheet_id: value.sheet_id,
                    worksheet: value.worksheet,
                    hostname_template,
                    ou_path: value.ou_path.filter(|ou| !ou.trim().is_empty()),
                },
            );
        }

        if domains.is_empty() {
            return Err(SetupError::config(
                "Configuration file must define at least one domain entry",
            ));
        }

        Ok(Self {
            google_credentials: raw.google_credentials,
            domains,
            ledger: raw.ledger,
            workflow: raw.workflow,
        })
    }

    /// Look up a domain by name, case-insensitively
    pub fn domain(&self, name: &str) -> SetupResult<&DomainConfig> {
        self.domains.get(&name.to_lowercase()).ok_or_else(|| {
            SetupError::config(format!("Domain '{}' not present in configuration", name))
        })
    }

    /// Service-account key path: command-line override first, then the
    /// configuration document.
    pub fn credentials_path(&self, override_path: Option<&Path>) -> SetupResult<PathBuf> {
        let chosen = override_path
            .map(Path::to_path_buf)
            .or_else(|| self.google_credentials.clone())
            .ok_or_else(|| {
                SetupError::config(
                    "Google credentials path must be supplied via --google-credentials or the configuration file",
                )
            })?;
        std::path::absolute(&chosen).map_err(|e| {
            SetupError::config(format!("Cannot resolve {}: {}", chosen.display(), e))
        })
    }
}

/// Normalize an assigned-user name into a hostname-safe slug.
///
/// Lower-cases, collapses every run of characters outside `[a-z0-9]` into a
/// single hyphen and trims hyphens from both ends. Empty results become
/// `"user"`.
pub fn slugify_user(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_hyphen = false;
    for c in value.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    if slug.is_empty() {
        "user".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Sequence { width: usize },
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("unsupported format spec '{0}' (use d or 0Nd)")]
    UnsupportedFormat(String),

    #[error("unbalanced braces")]
    Unbalanced,
}

/// Hostname template with `{seq}`, `{seq:0Nd}` and `{user}` placeholders.
/// Literal braces are written `{{` and `}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl HostnameTemplate {
    pub fn render(&self, seq: u32, user_slug: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Sequence { width } => out.push_str(&format!("{:0width$}", seq)),
                Segment::User => out.push_str(user_slug),
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for HostnameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_placeholder(body: &str) -> Result<Segment, TemplateError> {
    let (name, spec) = match body.split_once(':') {
        Some((name, spec)) => (name, Some(spec)),
        None => (body, None),
    };
    match (name, spec) {
        ("user", None) => Ok(Segment::User),
        ("seq", None) => Ok(Segment::Sequence { width: 0 }),
        ("seq", Some(spec)) => {
            let digits = spec
                .strip_suffix('d')
                .ok_or_else(|| TemplateError::UnsupportedFormat(spec.to_string()))?;
            if digits.is_empty() {
                return Ok(Segment::Sequence { width: 0 });
            }
            let width = digits
                .strip_prefix('0')
                .and_then(|w| w.parse::<usize>().ok())
                .ok_or_else(|| TemplateError::UnsupportedFormat(spec.to_string()))?;
            Ok(Segment::Sequence { width })
        }
        _ => Err(TemplateError::UnknownPlaceholder(body.to_string())),
    }
}

impl std::str::FromStr for HostnameTemplate {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(TemplateError::Unbalanced),
                            Some(other) => body.push(other),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&body)?);
                }
                '}' => return Err(TemplateError::Unbalanced),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_template_zero_pads_sequence() {
        let template: HostnameTemplate = "{seq:03d}-{user}".parse().unwrap();
        assert_eq!(template.render(1, "jane-doe"), "001-jane-doe");
        assert_eq!(template.render(1234, "x"), "1234-x");
    }

    #[test]
    fn test_template_variants() {
        let plain: HostnameTemplate = "WS{seq}".parse().unwrap();
        assert_eq!(plain.render(42, "u"), "WS42");

        let escaped: HostnameTemplate = "{{{user}}}-{seq:d}".parse().unwrap();
        assert_eq!(escaped.render(3, "bo"), "{bo}-3");

        assert_eq!(
            "{host}".parse::<HostnameTemplate>(),
            Err(TemplateError::UnknownPlaceholder("host".to_string()))
        );
        assert_eq!(
            "{seq:>5}".parse::<HostnameTemplate>(),
            Err(TemplateError::UnsupportedFormat(">5".to_string()))
        );
        assert_eq!(
            "{seq".parse::<HostnameTemplate>(),
            Err(TemplateError::Unbalanced)
        );
        assert_eq!(
            "seq}".parse::<HostnameTemplate>(),
            Err(TemplateError::Unbalanced)
        );
    }

    #[test]
    fn test_slugify_user() {
        assert_eq!(slugify_user("Jane Doe"), "jane-doe");
        assert_eq!(slugify_user("  --O'Brien, Pat--  "), "o-brien-pat");
        assert_eq!(slugify_user("ÅSA"), "sa");
        assert_eq!(slugify_user("!!!"), "user");
        assert_eq!(slugify_user(""), "user");
    }

    #[test]
    fn test_load_applies_defaults() {
        let (_dir, path) = write_config(
            r#"{
                "google_credentials": "creds.json",
                "domains": { "Corp.Example.com": { "sheet_id": "X" } }
            }"#,
        );
        let config = AppConfig::load(&path).unwrap();
        let domain = config.domain("corp.example.com").unwrap();
        assert_eq!(domain.sheet_id, "X");
        assert_eq!(domain.worksheet, "Devices");
        assert_eq!(domain.hostname_template.as_str(), "{seq:03d}-{user}");
        assert_eq!(domain.ou_path, None);
        assert_eq!(config.workflow.restart_delay_secs, 10);
        assert_eq!(config.ledger.allocation, AllocationStrategy::Optimistic);
        assert!(config.domain("CORP.EXAMPLE.COM").is_ok());
    }

    #[test]
    fn test_unknown_domain_is_config_error() {
        let (_dir, path) = write_config(r#"{ "domains": { "corp": { "sheet_id": "X" } } }"#);
        let config = AppConfig::load(&path).unwrap();
        assert!(matches!(config.domain("lab"), Err(SetupError::Config(_))));
    }

    #[test]
    fn test_missing_or_empty_config_fails() {
        let (_dir, path) = write_config(r#"{ "domains": {} }"#);
        assert!(matches!(AppConfig::load(&path), Err(SetupError::Config(_))));

        let missing = path.with_file_name("nope.json");
        assert!(matches!(AppConfig::load(&missing), Err(SetupError::Config(_))));

        let (_dir, broken) = write_config("{ not json");
        assert!(matches!(AppConfig::load(&broken), Err(SetupError::Config(_))));

        let (_dir, no_sheet) = write_config(r#"{ "domains": { "corp": { "worksheet": "A" } } }"#);
        assert!(matches!(AppConfig::load(&no_sheet), Err(SetupError::Config(_))));
    }

    #[test]
    fn test_credentials_override_wins() {
        let (_dir, path) = write_config(
            r#"{ "google_credentials": "/etc/from-config.json", "domains": { "corp": { "sheet_id": "X" } } }"#,
        );
        let config = AppConfig::load(&path).unwrap();
        let chosen = config
            .credentials_path(Some(Path::new("/tmp/override.json")))
            .unwrap();
        assert!(chosen.ends_with("override.json"));

        let fallback = config.credentials_path(None).unwrap();
        assert!(fallback.ends_with("from-config.json"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let (_dir, path) = write_config(
            r#"{ "ledger": { "timeout_secs": 5 }, "domains": { "corp": { "sheet_id": "X" } } }"#,
        );
        // No other test reads the ledger timeout, so the variable cannot leak into them.
        std::env::set_var("WORKSTATION_SETUP_LEDGER__TIMEOUT_SECS", "77");
        let loaded = AppConfig::load(&path);
        std::env::remove_var("WORKSTATION_SETUP_LEDGER__TIMEOUT_SECS");

        let config = loaded.unwrap();
        assert_eq!(config.ledger.timeout_secs, 77);
        assert_eq!(config.domain("corp").unwrap().sheet_id, "X");
    }
}

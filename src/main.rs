use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, Subscriber};
use tracing_subscriber::{
    filter::filter_fn,
    fmt::MakeWriter,
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};
use workstation_setup::{
    config::AppConfig,
    ledger::{LedgerClient, SheetsBackend},
    prompt::TerminalPrompt,
    protect,
    store::StateStore,
    system::{SystemActions, WindowsActions},
    ClaimRequest, FinishRequest, Provisioner, SetupError, SetupResult,
};

#[derive(Parser)]
#[command(name = "workstation-setup")]
#[command(about = "Two-phase first-boot provisioning of a domain workstation", version)]
struct Cli {
    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve a hostname, configure the machine and log off (run from the build account)
    InitialRun(InitialRunArgs),
    /// Join the domain and finish setup (run by the continuation after automatic logon)
    PostLogin(PostLoginArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the configuration JSON
    #[arg(long, default_value = "config/config.json")]
    config: PathBuf,

    /// Google service-account JSON (overrides the configuration file)
    #[arg(long)]
    google_credentials: Option<PathBuf>,

    /// State file location
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Args)]
struct InitialRunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Domain key from the configuration
    #[arg(long)]
    domain: String,

    /// Person the machine is assigned to; embedded in the hostname
    #[arg(long)]
    assigned_user: String,

    /// Temporary account to remove after the restart (default: current user)
    #[arg(long)]
    initial_user: Option<String>,

    /// Permanent local administrator account
    #[arg(long, default_value = "WorkstationAdmin")]
    local_admin: String,
}

#[derive(Args)]
struct PostLoginArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Do not restart after joining the domain
    #[arg(long)]
    no_restart: bool,
}

/// Target of the exit error record; the console prints that line itself.
const EXIT_TARGET: &str = "workstation_setup::exit";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_file.as_deref()) {
        eprintln!("[ERROR] {}", single_line(&e));
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command).await {
        error!(target: EXIT_TARGET, "{}", e);
        eprintln!("[ERROR] {}", single_line(&e));
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file = match log_file {
        Some(path) => Some(file_layer(Mutex::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        ))),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workstation_setup=info".into()),
        )
        .with(console_layer(std::io::stderr))
        .with(file)
        .init();
    Ok(())
}

fn console_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(filter_fn(|metadata| metadata.target() != EXIT_TARGET))
}

fn file_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
}

/// Error messages may carry multi-line API bodies; the exit message is one line.
fn single_line(error: &dyn std::fmt::Display) -> String {
    error
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let actions = WindowsActions::new();
    // Nothing is read or prompted for without administrative rights.
    if !actions.is_elevated().await.map_err(SetupError::from)? {
        return Err(SetupError::Privilege.into());
    }

    match command {
        Commands::InitialRun(args) => initial_run(&actions, args).await?,
        Commands::PostLogin(args) => post_login(&actions, args).await?,
    }
    Ok(())
}

async fn initial_run(actions: &WindowsActions, args: InitialRunArgs) -> SetupResult<()> {
    let config_path = absolute(&args.common.config)?;
    let config = AppConfig::load(&config_path)?;
    let ledger = ledger_client(&config, args.common.google_credentials.as_deref())?;
    let store = StateStore::new(state_path(args.common.state)?);
    let protector = protect::for_this_machine()?;
    let prompt = TerminalPrompt::new();

    let initial_user = match args.initial_user {
        Some(user) => user,
        None => current_user()?,
    };
    let program = std::env::current_exe()
        .map_err(|e| SetupError::config(format!("Cannot locate the running executable: {}", e)))?;
    let credentials_override = match args.common.google_credentials.as_deref() {
        Some(path) => Some(absolute(path)?),
        None => None,
    };

    let provisioner = Provisioner::new(actions, protector.as_ref(), &prompt, &store)
        .with_settings(config.workflow.clone());
    let outcome = provisioner
        .claim(
            &config,
            &ledger,
            &ClaimRequest {
                domain: args.domain,
                assigned_user: args.assigned_user,
                initial_user,
                local_admin: args.local_admin,
                config_path,
                credentials_override,
                program,
            },
        )
        .await?;

    info!(
        "Claimed {} (sequence {}, ledger row {}); waiting for logoff",
        outcome.hostname, outcome.sequence, outcome.row
    );
    Ok(())
}

async fn post_login(actions: &WindowsActions, args: PostLoginArgs) -> SetupResult<()> {
    let config = AppConfig::load(&absolute(&args.common.config)?)?;
    let ledger = ledger_client(&config, args.common.google_credentials.as_deref())?;
    let store = StateStore::new(state_path(args.common.state)?);
    let protector = protect::for_this_machine()?;
    let prompt = TerminalPrompt::new();

    let provisioner = Provisioner::new(actions, protector.as_ref(), &prompt, &store)
        .with_settings(config.workflow.clone());
    let outcome = provisioner
        .finish(
            &config,
            &ledger,
            FinishRequest {
                restart: !args.no_restart,
            },
        )
        .await?;

    if outcome.restarted {
        info!("{} joined; restart scheduled", outcome.hostname);
    } else {
        info!("{} joined; restart skipped", outcome.hostname);
    }
    Ok(())
}

fn ledger_client(config: &AppConfig, credentials: Option<&Path>) -> SetupResult<LedgerClient> {
    let credentials = config.credentials_path(credentials)?;
    let backend = SheetsBackend::new(&credentials, &config.ledger)?;
    Ok(LedgerClient::new(Arc::new(backend))
        .with_strategy(config.ledger.allocation, config.ledger.max_reserve_attempts))
}

fn state_path(explicit: Option<PathBuf>) -> SetupResult<PathBuf> {
    match explicit {
        Some(path) => absolute(&path),
        None => Ok(default_state_path()),
    }
}

#[cfg(windows)]
fn default_state_path() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
        .join("ComputerSetup")
        .join("state.json")
}

#[cfg(not(windows))]
fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/workstation-setup/state.json")
}

fn absolute(path: &Path) -> SetupResult<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| SetupError::config(format!("Cannot resolve {}: {}", path.display(), e)))
}

fn current_user() -> SetupResult<String> {
    ["USERNAME", "USER"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        .ok_or_else(|| {
            SetupError::config("Cannot determine the current user; pass --initial-user")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_exit_error_is_written_to_the_log_file_only() {
        let console = Captured::default();
        let file = Captured::default();
        let (c, f) = (console.clone(), file.clone());
        let subscriber = tracing_subscriber::registry()
            .with(console_layer(move || c.clone()))
            .with(file_layer(move || f.clone()));

        tracing::subscriber::with_default(subscriber, || {
            info!("Claimed 001-jane-doe");
            error!(target: EXIT_TARGET, "Ledger error: sheet unreachable");
        });

        let console = console.text();
        assert!(console.contains("Claimed 001-jane-doe"));
        assert!(!console.contains("sheet unreachable"));

        let file = file.text();
        assert!(file.contains("Claimed 001-jane-doe"));
        assert!(file.contains("sheet unreachable"));
    }

    #[test]
    fn test_single_line_joins_multi_line_messages() {
        let message = "Ledger error: HTTP 500\n  {\n    \"error\": \"backend\"\n  }\n";
        assert_eq!(
            single_line(&message),
            "Ledger error: HTTP 500 { \"error\": \"backend\" }"
        );
        assert_eq!(single_line(&SetupError::Privilege), SetupError::Privilege.to_string());
    }
}

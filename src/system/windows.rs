//! Windows implementation: PowerShell for accounts, registry values and the
//! domain join, `shutdown.exe` for log off and restart.
//!
//! Scripts are written to PowerShell's stdin so that passwords never show up
//! on a process command line.

use super::{ActionError, DomainJoin, SystemActions};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

const POWERSHELL: &str = "powershell.exe";
const SHUTDOWN: &str = "shutdown.exe";
const WINLOGON_KEY: &str = r"HKLM:\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Winlogon";
const RUN_ONCE_KEY: &str = r"HKLM:\SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce";

/// Quote a value as a PowerShell single-quoted string literal.
///
/// PowerShell also treats the typographic single quotes as quote characters,
/// so those are doubled too.
pub fn ps_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Wrap statements so any terminating error becomes exit code 1 with the
/// message on stderr.
fn wrap_script(statements: &[String]) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "$ErrorActionPreference = 'Stop'; try {{ {} }} catch {{ [Console]::Error.WriteLine($_.Exception.Message); exit 1 }}\n",
        statements.join("; ")
    ))
}

fn rename_script(new_name: &str) -> Vec<String> {
    vec![format!(
        "Rename-Computer -NewName {} -Force -ErrorAction Stop",
        ps_quote(new_name)
    )]
}

fn local_admin_script(username: &str, password: &str) -> Vec<String> {
    let user = ps_quote(username);
    vec![
        format!(
            "$SecurePassword = ConvertTo-SecureString {} -AsPlainText -Force",
            ps_quote(password)
        ),
        format!("$existing = Get-LocalUser -Name {} -ErrorAction SilentlyContinue", user),
        format!(
            "if ($existing) {{ Set-LocalUser -Name $existing.Name -Password $SecurePassword -PasswordNeverExpires $true -ErrorAction Stop }} else {{ New-LocalUser -Name {} -Password $SecurePassword -AccountNeverExpires -PasswordNeverExpires -ErrorAction Stop | Out-Null }}",
            user
        ),
        format!(
            "if (-not (Get-LocalGroupMember -Group 'Administrators' -ErrorAction SilentlyContinue | Where-Object {{ $_.Name -like ('*\\' + {}) }})) {{ Add-LocalGroupMember -Group 'Administrators' -Member {} -ErrorAction Stop }}",
            user, user
        ),
    ]
}

fn remove_user_script(username: &str) -> Vec<String> {
    vec![
        format!("$existing = Get-LocalUser -Name {} -ErrorAction SilentlyContinue", ps_quote(username)),
        "if ($existing) { Remove-LocalUser -Name $existing.Name -ErrorAction Stop }".to_string(),
    ]
}

fn set_values_script(key: &str, values: &[(&str, &str)]) -> Vec<String> {
    values
        .iter()
        .map(|(name, value)| {
            format!(
                "Set-ItemProperty -Path {} -Name {} -Value {} -Type String",
                ps_quote(key),
                ps_quote(name),
                ps_quote(value)
            )
        })
        .collect()
}

fn autologon_script(username: &str, password: &str) -> Vec<String> {
    let mut statements = set_values_script(
        WINLOGON_KEY,
        &[
            ("AutoAdminLogon", "1"),
            ("ForceAutoLogon", "1"),
            ("DefaultUserName", username),
            ("DefaultPassword", password),
        ],
    );
    statements.push(format!(
        "Set-ItemProperty -Path {} -Name 'DefaultDomainName' -Value $env:COMPUTERNAME -Type String",
        ps_quote(WINLOGON_KEY)
    ));
    statements
}

fn clear_autologon_script() -> Vec<String> {
    let mut statements =
        set_values_script(WINLOGON_KEY, &[("AutoAdminLogon", "0"), ("ForceAutoLogon", "0")]);
    for name in ["DefaultPassword", "DefaultDomainName"] {
        statements.push(format!(
            "Remove-ItemProperty -Path {} -Name {} -ErrorAction SilentlyContinue",
            ps_quote(WINLOGON_KEY),
            ps_quote(name)
        ));
    }
    statements
}

fn join_domain_script(request: &DomainJoin<'_>) -> Vec<String> {
    let mut add_computer = format!(
        "Add-Computer -DomainName {} -Credential $Credential",
        ps_quote(request.domain)
    );
    if let Some(ou) = request.ou_path {
        add_computer.push_str(&format!(" -OUPath {}", ps_quote(ou)));
    }
    add_computer.push_str(" -Force -ErrorAction Stop");

    vec![
        format!(
            "$SecurePassword = ConvertTo-SecureString {} -AsPlainText -Force",
            ps_quote(request.password)
        ),
        format!(
            "$Credential = New-Object System.Management.Automation.PSCredential({}, $SecurePassword)",
            ps_quote(request.username)
        ),
        add_computer,
    ]
}

/// [`SystemActions`] for a Windows workstation.
#[derive(Debug, Default, Clone)]
pub struct WindowsActions;

impl WindowsActions {
    pub fn new() -> Self {
        Self
    }

    async fn run_powershell(
        &self,
        action: &'static str,
        mut statements: Vec<String>,
    ) -> Result<String, ActionError> {
        let script = wrap_script(&statements);
        statements.zeroize();

        let spawn_error = |source| ActionError::Spawn {
            action,
            program: POWERSHELL,
            source,
        };

        let mut child = Command::new(POWERSHELL)
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ActionError::CommandFailed {
                action,
                detail: if stderr.is_empty() { stdout } else { stderr },
            });
        }
        debug!("{} completed", action);
        Ok(stdout)
    }

    async fn run_program(
        &self,
        action: &'static str,
        program: &'static str,
        args: &[&str],
    ) -> Result<(), ActionError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                action,
                program,
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ActionError::CommandFailed {
                action,
                detail: if stderr.is_empty() {
                    format!("{} exited with {}", program, output.status)
                } else {
                    stderr
                },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SystemActions for WindowsActions {
    #[cfg(windows)]
    async fn is_elevated(&self) -> Result<bool, ActionError> {
        let out = self
            .run_powershell(
                "elevation check",
                vec!["([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)".to_string()],
            )
            .await?;
        Ok(out.eq_ignore_ascii_case("true"))
    }

    #[cfg(not(windows))]
    async fn is_elevated(&self) -> Result<bool, ActionError> {
        let output = Command::new("id")
            .arg("-u")
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                action: "elevation check",
                program: "id",
                source,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "0")
    }

    async fn rename_computer(&self, new_name: &str) -> Result<(), ActionError> {
        self.run_powershell("rename computer", rename_script(new_name))
            .await
            .map(drop)
    }

    async fn create_or_update_local_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), ActionError> {
        self.run_powershell("create local admin", local_admin_script(username, password))
            .await
            .map(drop)
    }

    async fn remove_local_user(&self, username: &str) -> Result<(), ActionError> {
        self.run_powershell("remove local user", remove_user_script(username))
            .await
            .map(drop)
    }

    async fn configure_autologon(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), ActionError> {
        self.run_powershell("configure auto-logon", autologon_script(username, password))
            .await
            .map(drop)
    }

    async fn clear_autologon(&self) -> Result<(), ActionError> {
        self.run_powershell("clear auto-logon", clear_autologon_script())
            .await
            .map(drop)
    }

    async fn join_domain(&self, request: &DomainJoin<'_>) -> Result<(), ActionError> {
        self.run_powershell("join domain", join_domain_script(request))
            .await
            .map(drop)
    }

    async fn arm_continuation(&self, name: &str, command: &str) -> Result<(), ActionError> {
        self.run_powershell(
            "register continuation",
            set_values_script(RUN_ONCE_KEY, &[(name, command)]),
        )
        .await
        .map(drop)
    }

    async fn log_off(&self) -> Result<(), ActionError> {
        self.run_program("log off", SHUTDOWN, &["/l"]).await
    }

    async fn restart(&self, delay: Duration) -> Result<(), ActionError> {
        let seconds = delay.as_secs().to_string();
        self.run_program("restart", SHUTDOWN, &["/r", "/t", &seconds])
            .await
    }
}

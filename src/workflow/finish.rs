use super::phase::{FinishPhase, Tracker};
use super::{FinishOutcome, FinishRequest, Provisioner, PROVENANCE_NOTE};
use crate::config::AppConfig;
use crate::error::{SetupError, SetupResult};
use crate::ledger::LedgerClient;
use crate::system::DomainJoin;
use std::time::Duration;
use tracing::{error, info};
use workstation_setup_types::ReservationStatus;

impl Provisioner<'_> {
    /// Phase 2: tear down the temporary setup, join the domain, record the
    /// result in the ledger and restart.
    ///
    /// The saved state is cleared once the join has succeeded, even when the
    /// ledger update fails, so a second run cannot join twice.
    pub async fn finish(
        &self,
        config: &AppConfig,
        ledger: &LedgerClient,
        request: FinishRequest,
    ) -> SetupResult<FinishOutcome> {
        let mut phase = Tracker::start(FinishPhase::Claimed);
        self.ensure_elevated().await?;

        let state = self.store.load()?;
        let ou_path = config.domain(&state.domain)?.ou_path.clone();
        let location = state.ledger.location();
        let row = state.ledger.row().map_err(crate::ledger::LedgerError::from)?;
        let domain_password = self.protector.unprotect(&state.secrets.domain_password)?;
        info!(
            "Resuming setup of {} for domain {}",
            state.computer_name, state.domain
        );

        self.actions.clear_autologon().await?;
        phase.advance(FinishPhase::AutoLogonCleared);

        if state.removes_initial_user() {
            info!("Removing build user '{}'", state.initial_user);
            self.actions.remove_local_user(&state.initial_user).await?;
        } else {
            info!(
                "Build user '{}' is the permanent administrator; keeping it",
                state.initial_user
            );
        }
        phase.advance(FinishPhase::BuildUserRemoved);

        info!("Joining domain {}", state.domain);
        self.actions
            .join_domain(&DomainJoin {
                domain: &state.domain,
                username: &state.secrets.domain_username,
                password: &domain_password,
                ou_path: ou_path.as_deref(),
            })
            .await?;
        drop(domain_password);
        phase.advance(FinishPhase::DomainJoined);

        let finalized = ledger
            .finalize(&location, &row, ReservationStatus::Joined, PROVENANCE_NOTE)
            .await;
        if finalized.is_ok() {
            phase.advance(FinishPhase::LedgerFinalized);
        }

        self.store.clear()?;
        if let Err(e) = finalized {
            error!(
                "Joined {} but could not update ledger row {} in {} after phase {}; mark the row Joined by hand",
                state.domain,
                row,
                location,
                phase.current()
            );
            return Err(SetupError::from(e));
        }
        phase.advance(FinishPhase::StateCleared);

        let restarted = if request.restart {
            let delay = Duration::from_secs(self.settings.restart_delay_secs);
            self.prompt
                .notify(&format!("Restarting in {} seconds...", delay.as_secs()))
                .await;
            self.actions.restart(delay).await?;
            true
        } else {
            self.prompt
                .notify("Restart skipped; restart the computer to finish joining the domain.")
                .await;
            false
        };
        phase.advance(FinishPhase::Completed);

        Ok(FinishOutcome {
            hostname: state.computer_name.clone(),
            restarted,
        })
    }
}

use super::phase::{ClaimPhase, Tracker};
use super::{continuation_command, ClaimOutcome, ClaimRequest, Provisioner};
use crate::config::{slugify_user, AppConfig};
use crate::error::SetupResult;
use crate::ledger::LedgerClient;
use crate::prompt::{capture_new_password, capture_password, capture_required_line};
use tracing::info;
use workstation_setup_types::{
    LedgerIdentity, LedgerLocation, Secrets, WorkflowState, STATE_VERSION,
};

impl Provisioner<'_> {
    /// Phase 1: reserve an identity, configure the machine for automatic
    /// logon, persist the state and end the session.
    pub async fn claim(
        &self,
        config: &AppConfig,
        ledger: &LedgerClient,
        request: &ClaimRequest,
    ) -> SetupResult<ClaimOutcome> {
        let mut phase = Tracker::start(ClaimPhase::Unclaimed);
        self.ensure_elevated().await?;

        let domain = config.domain(&request.domain)?;
        let user_slug = slugify_user(&request.assigned_user);
        let location = LedgerLocation::new(&domain.sheet_id, &domain.worksheet);

        info!("Reserving hostname for {} in {}", domain.name, location);
        let reservation = ledger
            .reserve_identity(&domain.name, &user_slug, &location, |seq| {
                domain.build_hostname(seq, &user_slug)
            })
            .await?;
        info!(
            "Reserved {} (sequence {}) at {}",
            reservation.hostname, reservation.sequence, reservation.row
        );
        phase.advance(ClaimPhase::Reserved);

        let admin_password =
            capture_new_password(self.prompt, &format!("password for {}", request.local_admin))
                .await?;
        let domain_username = capture_required_line(self.prompt, "domain join username").await?;
        let domain_password = capture_password(self.prompt, "domain join password").await?;
        phase.advance(ClaimPhase::CredentialsCaptured);

        info!("Renaming computer to {}", reservation.hostname);
        self.actions.rename_computer(&reservation.hostname).await?;
        info!("Configuring local administrator {}", request.local_admin);
        self.actions
            .create_or_update_local_admin(&request.local_admin, &admin_password)
            .await?;
        self.actions
            .configure_autologon(&request.local_admin, &admin_password)
            .await?;
        phase.advance(ClaimPhase::MachineConfigured);

        let state = WorkflowState {
            version: STATE_VERSION,
            domain: domain.name.clone(),
            assigned_user: user_slug.clone(),
            computer_name: reservation.hostname.clone(),
            initial_user: request.initial_user.clone(),
            local_admin_user: request.local_admin.clone(),
            ledger: LedgerIdentity {
                sheet_id: location.sheet_id.clone(),
                worksheet: location.worksheet.clone(),
                row_reference: reservation.row.to_string(),
            },
            secrets: Secrets {
                local_admin_password: self.protector.protect(&admin_password)?,
                domain_username,
                domain_password: self.protector.protect(&domain_password)?,
            },
        };
        let state_path = self.store.save(&state)?;
        phase.advance(ClaimPhase::StatePersisted);

        let command = continuation_command(
            &request.program,
            &state_path,
            &request.config_path,
            request.credentials_override.as_deref(),
        );
        info!("Registering continuation {}", self.settings.continuation_name);
        self.actions
            .arm_continuation(&self.settings.continuation_name, &command)
            .await?;
        phase.advance(ClaimPhase::ContinuationArmed);

        self.prompt
            .notify("Logging off to continue setup after automatic logon...")
            .await;
        self.actions.log_off().await?;
        phase.advance(ClaimPhase::Suspended);

        Ok(ClaimOutcome {
            sequence: reservation.sequence,
            hostname: reservation.hostname,
            row: reservation.row,
        })
    }
}

use std::fmt;
use tracing::info;

/// Progress of the claim phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimPhase {
    Unclaimed,
    Reserved,
    CredentialsCaptured,
    MachineConfigured,
    StatePersisted,
    ContinuationArmed,
    /// The session has been ended; the post-login phase takes over.
    Suspended,
}

impl ClaimPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::Reserved => "reserved",
            Self::CredentialsCaptured => "credentials_captured",
            Self::MachineConfigured => "machine_configured",
            Self::StatePersisted => "state_persisted",
            Self::ContinuationArmed => "continuation_armed",
            Self::Suspended => "suspended",
        }
    }
}

/// Progress of the post-login phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FinishPhase {
    Claimed,
    AutoLogonCleared,
    BuildUserRemoved,
    DomainJoined,
    LedgerFinalized,
    StateCleared,
    Completed,
}

impl FinishPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::AutoLogonCleared => "auto_logon_cleared",
            Self::BuildUserRemoved => "build_user_removed",
            Self::DomainJoined => "domain_joined",
            Self::LedgerFinalized => "ledger_finalized",
            Self::StateCleared => "state_cleared",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FinishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of a running state machine. Transitions only move forward.
#[derive(Debug)]
pub(crate) struct Tracker<P> {
    current: P,
}

impl<P: Copy + Ord + fmt::Display> Tracker<P> {
    pub(crate) fn start(initial: P) -> Self {
        info!(phase = %initial, "Entering phase");
        Self { current: initial }
    }

    pub(crate) fn advance(&mut self, next: P) {
        debug_assert!(next > self.current, "phase moved backwards");
        info!(from = %self.current, to = %next, "Phase transition");
        self.current = next;
    }

    pub(crate) fn current(&self) -> P {
        self.current
    }
}

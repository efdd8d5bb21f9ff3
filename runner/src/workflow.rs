use crate::codesign::{SigningIdentity, SigningTool};
use crate::entitlements::{Divergence, EntitlementSet};
use crate::evidence::{self, ExecutableFingerprint};
use crate::reader::{ReadError, read_entitlements};
use crate::settings::{SettingsError, SettingsStore};
use crate::target::SigningTarget;
use crate::writer::{WriteError, apply_entitlements};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    AlreadySatisfied,
    Applied,
    AppliedButUnverified,
    ApplyFailed,
    ReadFailed,
}

impl ReconciliationOutcome {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ReconciliationOutcome::AlreadySatisfied | ReconciliationOutcome::Applied
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationOutcome::AlreadySatisfied => "already_satisfied",
            ReconciliationOutcome::Applied => "applied",
            ReconciliationOutcome::AppliedButUnverified => "applied_but_unverified",
            ReconciliationOutcome::ApplyFailed => "apply_failed",
            ReconciliationOutcome::ReadFailed => "read_failed",
        }
    }
}

impl fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read current entitlements: {0}")]
    Read(#[source] ReadError),
    #[error("modification not authorized: {0}")]
    Refused(String),
    #[error("failed to apply entitlements: {0}")]
    Apply(#[source] WriteError),
    #[error("entitlements not retained after signing: {}", divergence_keys(.divergences))]
    Unverified { divergences: Vec<Divergence> },
    #[error("failed to re-read entitlements after signing: {0}")]
    VerifyRead(#[source] ReadError),
}

impl ReconcileError {
    pub fn outcome(&self) -> ReconciliationOutcome {
        match self {
            ReconcileError::Read(_) => ReconciliationOutcome::ReadFailed,
            ReconcileError::Refused(_) | ReconcileError::Apply(_) => {
                ReconciliationOutcome::ApplyFailed
            }
            ReconcileError::Unverified { .. } | ReconcileError::VerifyRead(_) => {
                ReconciliationOutcome::AppliedButUnverified
            }
        }
    }

    pub fn divergences(&self) -> &[Divergence] {
        match self {
            ReconcileError::Unverified { divergences } => divergences,
            _ => &[],
        }
    }
}

fn divergence_keys(divergences: &[Divergence]) -> String {
    divergences
        .iter()
        .map(|d| d.key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciled {
    pub outcome: ReconciliationOutcome,
    /// Set when a forced reapply completed; the caller's settings store
    /// should clear its flag.
    pub reapply_discharged: bool,
    pub before: Option<ExecutableFingerprint>,
    pub after: Option<ExecutableFingerprint>,
}

/// Consulted right before the executable is modified: the target must not
/// be running and the user must have agreed. A refusal aborts with nothing
/// written.
pub trait WriteGate {
    fn approve(&self, target: &SigningTarget) -> Result<(), String>;
}

pub struct AlwaysAllow;

impl WriteGate for AlwaysAllow {
    fn approve(&self, _target: &SigningTarget) -> Result<(), String> {
        Ok(())
    }
}

/// Drives one target to the expected entitlements.
///
/// Not safe to run concurrently against the same executable; callers
/// serialize per target.
pub struct Reconciler<'a, T: SigningTool + ?Sized> {
    tool: &'a T,
    expected: EntitlementSet,
    identity: SigningIdentity,
    scratch_dir: PathBuf,
}

impl<'a, T: SigningTool + ?Sized> Reconciler<'a, T> {
    pub fn new(tool: &'a T, expected: EntitlementSet) -> Self {
        Self {
            tool,
            expected,
            identity: SigningIdentity::ad_hoc(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_identity(mut self, identity: SigningIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub fn expected(&self) -> &EntitlementSet {
        &self.expected
    }

    /// Reads the target and reports which expected entitlements are missing
    /// or different. An entitlement-less binary diverges on every key.
    pub fn check(&self, target: &SigningTarget) -> Result<Vec<Divergence>, ReadError> {
        let observed = self.observe(target)?;
        Ok(self.expected.divergences(&observed))
    }

    pub fn reconcile(
        &self,
        target: &SigningTarget,
        force: bool,
        gate: &dyn WriteGate,
    ) -> Result<Reconciled, ReconcileError> {
        let executable = target.executable();
        tracing::info!(executable = %executable.display(), force, "checking entitlements");

        let divergences = self.check(target).map_err(ReconcileError::Read)?;
        if divergences.is_empty() && !force {
            tracing::info!("target already has the required entitlements");
            return Ok(Reconciled {
                outcome: ReconciliationOutcome::AlreadySatisfied,
                reapply_discharged: false,
                before: None,
                after: None,
            });
        }
        if force {
            tracing::info!("forcing entitlement re-application");
        } else {
            tracing::info!(missing = divergences.len(), "entitlements need to be applied");
        }

        gate.approve(target).map_err(|reason| {
            tracing::error!("not applying entitlements: {reason}");
            ReconcileError::Refused(reason)
        })?;

        let before = evidence::try_fingerprint(executable);
        apply_entitlements(self.tool, target, &self.expected, &self.identity, &self.scratch_dir)
            .map_err(ReconcileError::Apply)?;
        let after = evidence::try_fingerprint(executable);

        tracing::info!("verifying applied entitlements");
        let remaining = self.check(target).map_err(|err| {
            tracing::error!("failed to verify entitlements: {err}");
            ReconcileError::VerifyRead(err)
        })?;
        if !remaining.is_empty() {
            tracing::error!(
                keys = %divergence_keys(&remaining),
                "signer exited cleanly but entitlements were not retained"
            );
            return Err(ReconcileError::Unverified {
                divergences: remaining,
            });
        }

        tracing::info!(
            executable = %executable.display(),
            "successfully applied loader entitlements"
        );
        Ok(Reconciled {
            outcome: ReconciliationOutcome::Applied,
            reapply_discharged: force,
            before,
            after,
        })
    }

    fn observe(&self, target: &SigningTarget) -> Result<EntitlementSet, ReadError> {
        match read_entitlements(self.tool, target.executable()) {
            Err(ReadError::NoData) => Ok(EntitlementSet::new()),
            other => other,
        }
    }
}

/// Clears the persisted force flag once a forced reapply is done. Returns
/// whether the flag was cleared.
pub fn discharge_reapply(
    store: &mut dyn SettingsStore,
    reconciled: &Reconciled,
) -> Result<bool, SettingsError> {
    if !reconciled.reapply_discharged || !store.force_reapply()? {
        return Ok(false);
    }
    tracing::info!("clearing entitlement re-application flag");
    store.set_force_reapply(false)?;
    Ok(true)
}

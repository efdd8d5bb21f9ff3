use crate::codesign::{SigningIdentity, SigningTool, exit_label, reports_unsigned};
use crate::entitlements::EntitlementSet;
use crate::target::SigningTarget;
use std::error::Error as StdError;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write entitlements descriptor: {0}")]
    SerializationFailed(#[source] Box<dyn StdError + Send + Sync>),
    #[error("failed to launch the signing tool: {0}")]
    Launch(#[source] io::Error),
    #[error("codesign failed applying entitlements ({})", exit_label(.exit_code))]
    ApplyFailed { exit_code: Option<i32> },
}

/// Entitlements plist handed to `codesign --entitlements`, alive for exactly
/// one apply. `release` is the normal removal path; the drop of the inner
/// temp file only runs if the apply unwinds.
pub struct TransientDescriptor {
    file: NamedTempFile,
}

impl TransientDescriptor {
    pub fn create(scratch_dir: &Path, set: &EntitlementSet) -> Result<Self, WriteError> {
        let xml = set
            .to_plist_xml()
            .map_err(|e| WriteError::SerializationFailed(Box::new(e)))?;
        let mut file = tempfile::Builder::new()
            .prefix("entitlements-")
            .suffix(".plist")
            .tempfile_in(scratch_dir)
            .map_err(|e| WriteError::SerializationFailed(Box::new(e)))?;
        file.write_all(&xml)
            .and_then(|()| file.flush())
            .map_err(|e| WriteError::SerializationFailed(Box::new(e)))?;
        tracing::debug!(path = %file.path().display(), "wrote entitlements descriptor");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn release(self) -> io::Result<()> {
        self.file.close()
    }
}

/// Re-signs only `target`'s main executable with `desired`. Nested
/// frameworks and plugins keep their own signatures.
///
/// `Ok` means the apply step exited zero; callers still re-read to verify.
pub fn apply_entitlements<T: SigningTool + ?Sized>(
    tool: &T,
    target: &SigningTarget,
    desired: &EntitlementSet,
    identity: &SigningIdentity,
    scratch_dir: &Path,
) -> Result<(), WriteError> {
    let executable = target.executable();
    let descriptor = TransientDescriptor::create(scratch_dir, desired)?;

    strip_existing_signature(tool, executable);

    tracing::info!(
        executable = %executable.display(),
        identity = %identity,
        ad_hoc = identity.is_ad_hoc(),
        "signing executable with entitlements"
    );
    let applied = tool.apply(executable, descriptor.path(), identity);
    let descriptor_path = descriptor.path().to_path_buf();
    if let Err(err) = descriptor.release() {
        tracing::warn!(
            path = %descriptor_path.display(),
            "failed to remove entitlements descriptor: {err}"
        );
    }

    let output = applied.map_err(|err| {
        tracing::error!("error running codesign: {err}");
        WriteError::Launch(err)
    })?;
    output.log_streams("codesign");
    if !output.success() {
        tracing::error!("codesign failed with {}", exit_label(&output.exit_code));
        return Err(WriteError::ApplyFailed {
            exit_code: output.exit_code,
        });
    }

    tracing::info!(executable = %executable.display(), "successfully signed main executable");
    Ok(())
}

/// Removes the previous signature. Never fatal: an unsigned binary refuses
/// the strip, and the apply step decides the outcome either way.
fn strip_existing_signature<T: SigningTool + ?Sized>(tool: &T, executable: &Path) {
    tracing::info!(executable = %executable.display(), "removing old signature");
    match tool.strip_signature(executable) {
        Ok(output) if output.success() => {
            tracing::debug!("removed existing signature");
        }
        Ok(output) if reports_unsigned(&output.stderr) => {
            tracing::debug!("no existing signature to remove: {}", output.stderr.trim());
        }
        Ok(output) => {
            tracing::warn!(
                status = %exit_label(&output.exit_code),
                "removing the old signature failed; continuing with apply"
            );
            output.log_streams("codesign --remove-signature");
        }
        Err(err) => {
            tracing::warn!("failed to launch codesign for signature removal: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::testing::{Call, FakeSigner, bundle_fixture};
    use crate::entitlements::loader_entitlements;

    fn scratch_is_empty(scratch: &Path) -> bool {
        std::fs::read_dir(scratch).unwrap().next().is_none()
    }

    #[test]
    fn signs_main_executable_and_removes_descriptor() {
        let (_dir, target, scratch) = bundle_fixture();
        let tool = FakeSigner::default();

        apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::ad_hoc(),
            &scratch,
        )
        .unwrap();

        let calls = tool.calls.borrow().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::Strip(target.executable().to_path_buf()));
        match &calls[1] {
            Call::Apply {
                executable,
                descriptor,
                identity,
            } => {
                assert_eq!(executable, target.executable());
                assert!(descriptor.starts_with(&scratch));
                assert!(!descriptor.exists());
                assert_eq!(identity, "-");
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(tool.descriptor_contents.borrow()[0], loader_entitlements());
        assert_eq!(*tool.installed.borrow(), Some(loader_entitlements()));
        assert!(scratch_is_empty(&scratch));
    }

    #[test]
    fn never_touches_bundle_root() {
        let (_dir, target, scratch) = bundle_fixture();
        let tool = FakeSigner::with_installed(EntitlementSet::new());
        apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::ad_hoc(),
            &scratch,
        )
        .unwrap();
        for call in tool.calls.borrow().iter() {
            let path = match call {
                Call::Describe(p) | Call::Strip(p) => p,
                Call::Apply { executable, .. } => executable,
            };
            assert_eq!(path, target.executable());
            assert_ne!(path, target.bundle_root());
        }
    }

    #[test]
    fn apply_failure_still_removes_descriptor() {
        let (_dir, target, scratch) = bundle_fixture();
        let tool = FakeSigner {
            apply_exit: 1,
            ..FakeSigner::default()
        };
        let err = apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::ad_hoc(),
            &scratch,
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::ApplyFailed { exit_code: Some(1) }));
        let descriptors = tool.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert!(!descriptors[0].exists());
        assert!(scratch_is_empty(&scratch));
    }

    #[test]
    fn strip_failure_is_not_fatal() {
        let (_dir, target, scratch) = bundle_fixture();
        let tool = FakeSigner {
            strip_exit: Some(139),
            ..FakeSigner::default()
        };
        apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::new("Developer ID Application: Example"),
            &scratch,
        )
        .unwrap();
        assert_eq!(tool.apply_count(), 1);
    }

    #[test]
    fn descriptor_failure_spawns_nothing() {
        let (dir, target, _scratch) = bundle_fixture();
        let tool = FakeSigner::default();
        let err = apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::ad_hoc(),
            &dir.path().join("missing-scratch"),
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::SerializationFailed(_)));
        assert!(tool.calls.borrow().is_empty());
    }

    #[test]
    fn launch_failure_still_removes_descriptor() {
        let (_dir, target, scratch) = bundle_fixture();
        let tool = FakeSigner {
            apply_launch_error: true,
            ..FakeSigner::default()
        };
        let err = apply_entitlements(
            &tool,
            &target,
            &loader_entitlements(),
            &SigningIdentity::ad_hoc(),
            &scratch,
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::Launch(_)));
        let descriptors = tool.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert!(!descriptors[0].exists());
        assert_eq!(tool.descriptor_contents.borrow()[0], loader_entitlements());
        assert!(scratch_is_empty(&scratch));
    }
}

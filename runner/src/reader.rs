use crate::codesign::{SigningTool, exit_label, reports_unsigned};
use crate::entitlements::{EntitlementSet, ParseError};
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to launch the signing tool: {0}")]
    Launch(#[source] io::Error),
    #[error("signing tool failed to describe entitlements ({})", exit_label(.exit_code))]
    ToolFailed { exit_code: Option<i32> },
    #[error("no entitlements present")]
    NoData,
    #[error("failed to parse entitlements: {0}")]
    ParseFailed(#[from] ParseError),
}

/// Reads the entitlements embedded in `executable`'s signature. Spawns one
/// short-lived child process and writes nothing.
///
/// An unsigned binary makes codesign exit non-zero; that and a signature
/// without entitlements both come back as [`ReadError::NoData`].
pub fn read_entitlements<T: SigningTool + ?Sized>(
    tool: &T,
    executable: &Path,
) -> Result<EntitlementSet, ReadError> {
    let output = tool
        .describe_entitlements(executable)
        .map_err(ReadError::Launch)?;

    if !output.success() {
        if reports_unsigned(&output.stderr) {
            tracing::info!(
                executable = %executable.display(),
                "executable is not signed: {}",
                output.stderr.trim()
            );
            return Err(ReadError::NoData);
        }
        tracing::error!(
            executable = %executable.display(),
            status = %exit_label(&output.exit_code),
            "codesign failed reading entitlements"
        );
        output.log_streams("codesign");
        return Err(ReadError::ToolFailed {
            exit_code: output.exit_code,
        });
    }

    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        tracing::info!(
            executable = %executable.display(),
            "no entitlements data received from codesign"
        );
        return Err(ReadError::NoData);
    }

    let set = EntitlementSet::from_plist_bytes(&output.stdout).inspect_err(|err| {
        tracing::error!(
            executable = %executable.display(),
            "failed to parse entitlements plist: {err}"
        );
    })?;
    tracing::debug!(executable = %executable.display(), count = set.len(), "read entitlements");
    Ok(set)
}

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_CODESIGN: &str = "/usr/bin/codesign";

/// Identity handed to `codesign --sign`. `-` signs ad-hoc, without a
/// certificate-backed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity(String);

impl SigningIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn ad_hoc() -> Self {
        Self("-".to_string())
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.0 == "-"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SigningIdentity {
    fn default() -> Self {
        Self::ad_hoc()
    }
}

impl fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully captured result of one signing tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Logs whichever streams are non-empty; errors for a failed run.
    pub fn log_streams(&self, label: &str) {
        let stdout = self.stdout_lossy();
        let stdout = stdout.trim();
        let stderr = self.stderr.trim();
        if self.success() {
            if !stdout.is_empty() {
                tracing::info!("{label} stdout: {stdout}");
            }
            if !stderr.is_empty() {
                tracing::info!("{label} stderr: {stderr}");
            }
        } else {
            if !stdout.is_empty() {
                tracing::error!("{label} stdout: {stdout}");
            }
            if !stderr.is_empty() {
                tracing::error!("{label} stderr: {stderr}");
            }
        }
    }
}

/// codesign's complaint about a binary that carries no signature at all,
/// printed by both `-d` and `--remove-signature`.
pub fn reports_unsigned(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("not signed")
}

pub fn exit_label(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}

/// The three invocations the reconciliation needs from the external signer.
///
/// `Err` means the process could not be launched at all; a non-zero exit is
/// reported through [`ToolOutput::exit_code`].
pub trait SigningTool {
    fn describe_entitlements(&self, executable: &Path) -> io::Result<ToolOutput>;

    fn strip_signature(&self, executable: &Path) -> io::Result<ToolOutput>;

    fn apply(
        &self,
        executable: &Path,
        descriptor: &Path,
        identity: &SigningIdentity,
    ) -> io::Result<ToolOutput>;
}

#[derive(Debug, Clone)]
pub struct Codesign {
    program: PathBuf,
}

impl Default for Codesign {
    fn default() -> Self {
        Self::new(DEFAULT_CODESIGN)
    }
}

impl Codesign {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: Vec<OsString>) -> io::Result<ToolOutput> {
        tracing::debug!(
            program = %self.program.display(),
            args = ?args,
            "running signing tool"
        );
        let output = Command::new(&self.program).args(&args).output()?;
        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        tracing::debug!(
            program = %self.program.display(),
            status = %exit_label(&result.exit_code),
            stdout_bytes = result.stdout.len(),
            "signing tool exited"
        );
        Ok(result)
    }
}

pub fn describe_args(executable: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-d", "--entitlements", ":-", "--xml"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(executable.as_os_str().to_os_string());
    args
}

pub fn strip_args(executable: &Path) -> Vec<OsString> {
    vec![
        OsString::from("--remove-signature"),
        executable.as_os_str().to_os_string(),
    ]
}

pub fn apply_args(
    executable: &Path,
    descriptor: &Path,
    identity: &SigningIdentity,
) -> Vec<OsString> {
    vec![
        OsString::from("--force"),
        OsString::from("--options"),
        OsString::from("runtime"),
        OsString::from("--sign"),
        OsString::from(identity.as_str()),
        OsString::from("--entitlements"),
        descriptor.as_os_str().to_os_string(),
        executable.as_os_str().to_os_string(),
    ]
}

impl SigningTool for Codesign {
    fn describe_entitlements(&self, executable: &Path) -> io::Result<ToolOutput> {
        self.run(describe_args(executable))
    }

    fn strip_signature(&self, executable: &Path) -> io::Result<ToolOutput> {
        self.run(strip_args(executable))
    }

    fn apply(
        &self,
        executable: &Path,
        descriptor: &Path,
        identity: &SigningIdentity,
    ) -> io::Result<ToolOutput> {
        tracing::info!(
            "Command: {} --force --options runtime --sign {} --entitlements {} {}",
            self.program.display(),
            identity,
            descriptor.display(),
            executable.display()
        );
        self.run(apply_args(executable, descriptor, identity))
    }
}

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Content fingerprint of the main executable, taken around a write so the
/// report shows whether the signer actually rewrote the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableFingerprint {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Hashes and sizes `path` in a single read.
pub fn fingerprint(path: &Path) -> io::Result<ExecutableFingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size_bytes = io::copy(&mut file, &mut hasher)?;
    Ok(ExecutableFingerprint {
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes,
    })
}

/// Best-effort: a digest failure is logged and never changes an outcome.
pub fn try_fingerprint(path: &Path) -> Option<ExecutableFingerprint> {
    match fingerprint(path) {
        Ok(fp) => Some(fp),
        Err(err) => {
            tracing::warn!(path = %path.display(), "failed to fingerprint executable: {err}");
            None
        }
    }
}

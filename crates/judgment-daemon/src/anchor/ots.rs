//! OpenTimestamps anchoring via the `ots` command-line client.
//!
//! Stamping writes the record hash to a scratch file and invokes
//! `ots stamp`, which drops a `.ots` proof next to it. The initial proof is
//! pending: it commits to a Bitcoin transaction that has not confirmed yet.
//! `ots upgrade` later replaces it with a self-contained attestation, which
//! is when the anchor becomes terminal.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use judgment_core::record::AnchorType;

use super::{AnchorTransport, TransportError};

/// Scratch file name used for stamping; the CLI derives the proof path from
/// it by appending `.ots`.
const STAMP_FILE: &str = "record.hash";
const PROOF_FILE: &str = "record.hash.ots";

/// `ots` CLI transport.
pub struct OtsCliTransport {
    binary: PathBuf,
    timeout: Duration,
}

impl OtsCliTransport {
    /// Creates a transport invoking `binary` (or `ots` from `PATH` when
    /// `None`) with the given per-command timeout.
    #[must_use]
    pub fn new(binary: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| PathBuf::from("ots")),
            timeout,
        }
    }

    async fn run<I, S>(&self, args: I) -> Result<Output, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = tokio::process::Command::new(&self.binary);
        command.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TransportError::Timeout {
                secs: self.timeout.as_secs(),
            })?;

        output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::ToolingMissing {
                    binary: self.binary.display().to_string(),
                }
            } else {
                TransportError::Unavailable {
                    message: e.to_string(),
                }
            }
        })
    }
}

async fn write_scratch(path: &Path, bytes: &[u8]) -> Result<(), TransportError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| TransportError::Unavailable {
            message: format!("scratch write failed: {e}"),
        })
}

async fn read_scratch(path: &Path) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::Unavailable {
            message: format!("scratch read failed: {e}"),
        })
}

fn scratch_dir() -> Result<tempfile::TempDir, TransportError> {
    tempfile::tempdir().map_err(|e| TransportError::Unavailable {
        message: format!("scratch dir failed: {e}"),
    })
}

#[async_trait]
impl AnchorTransport for OtsCliTransport {
    fn kind(&self) -> AnchorType {
        AnchorType::Ots
    }

    async fn submit(&self, hash_hex: &str) -> Result<Vec<u8>, TransportError> {
        let dir = scratch_dir()?;
        let stamp_path = dir.path().join(STAMP_FILE);
        write_scratch(&stamp_path, hash_hex.as_bytes()).await?;

        let output = self
            .run([OsStr::new("stamp"), stamp_path.as_os_str()])
            .await?;
        if !output.status.success() {
            return Err(TransportError::Failed {
                message: stderr_summary(&output),
            });
        }

        let proof = read_scratch(&dir.path().join(PROOF_FILE)).await?;
        debug!(hash = hash_hex, proof_len = proof.len(), "ots stamp complete");
        Ok(proof)
    }

    async fn upgrade(&self, proof: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let dir = scratch_dir()?;
        let proof_path = dir.path().join(PROOF_FILE);
        write_scratch(&proof_path, proof).await?;

        let output = self
            .run([OsStr::new("upgrade"), proof_path.as_os_str()])
            .await?;
        if !output.status.success() {
            // The CLI reports a proof that cannot be upgraded yet as a
            // failure; that is the routine retry-later case, not an error.
            let stderr = stderr_summary(&output);
            if stderr.to_lowercase().contains("already") {
                return Ok(None);
            }
            return Err(TransportError::Failed { message: stderr });
        }

        let upgraded = read_scratch(&proof_path).await?;
        if upgraded == proof {
            Ok(None)
        } else {
            debug!(
                old_len = proof.len(),
                new_len = upgraded.len(),
                "ots proof upgraded"
            );
            Ok(Some(upgraded))
        }
    }
}

fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("exit status {}", output.status)
    } else {
        trimmed.to_string()
    }
}

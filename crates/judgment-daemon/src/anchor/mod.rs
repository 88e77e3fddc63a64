//! External anchoring transports and graceful degradation.
//!
//! A transport submits a record hash to an external timestamping system and
//! later upgrades the returned proof to its final form. Transports are
//! deliberately fallible: the create path must keep working when the external
//! tooling is missing, slow, or down. [`AnchorService`] owns that policy —
//! a failed or unavailable submission degrades the record to an unanchored
//! one with an explanatory note instead of failing the request.

pub mod ots;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use judgment_core::record::AnchorType;

pub use ots::OtsCliTransport;

/// Transport-level failures. These never surface to record creators; the
/// service converts them into a degraded outcome. The proof-upgrade worker
/// sees them as-is and retries on the next cycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The external binary is not installed or not on the probe path.
    #[error("anchoring tool not found: {binary}")]
    ToolingMissing {
        /// Binary that could not be located.
        binary: String,
    },

    /// The external command did not finish within the configured timeout.
    #[error("anchoring command timed out after {secs}s")]
    Timeout {
        /// Configured timeout that elapsed.
        secs: u64,
    },

    /// The external command ran and reported failure.
    #[error("anchoring command failed: {message}")]
    Failed {
        /// Stderr or exit-status detail.
        message: String,
    },

    /// Spawning or I/O around the command failed.
    #[error("anchoring transport unavailable: {message}")]
    Unavailable {
        /// Underlying failure detail.
        message: String,
    },
}

/// A backend capable of anchoring record hashes to an external system.
#[async_trait]
pub trait AnchorTransport: Send + Sync {
    /// The anchor type this backend produces.
    fn kind(&self) -> AnchorType;

    /// Submits a hex-encoded record hash, returning the initial proof bytes.
    async fn submit(&self, hash_hex: &str) -> Result<Vec<u8>, TransportError>;

    /// Attempts to upgrade a pending proof to its final form.
    ///
    /// Returns `Ok(Some(bytes))` with the upgraded proof, or `Ok(None)` when
    /// the proof is not yet upgradable and should be retried later.
    async fn upgrade(&self, proof: &[u8]) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Outcome of resolving and submitting an anchor request.
#[derive(Debug, Clone)]
pub struct AnchorOutcome {
    /// Anchor type actually applied, after any degradation.
    pub effective: AnchorType,
    /// Backend-specific reference for the submission.
    pub reference: Option<String>,
    /// Initial proof bytes, when a submission succeeded.
    pub proof: Option<Vec<u8>>,
    /// Set when the anchor state is already terminal.
    pub anchored_at: Option<DateTime<Utc>>,
    /// Whether a background upgrade is still expected.
    pub pending: bool,
    /// Human-readable explanation when the request was degraded.
    pub note: Option<String>,
}

/// Resolves anchor requests against the registered transports and applies
/// the degradation policy.
#[derive(Clone)]
pub struct AnchorService {
    transports: HashMap<AnchorType, Arc<dyn AnchorTransport>>,
}

impl AnchorService {
    /// Creates a service with no registered transports. Every anchoring
    /// request then degrades to an unanchored record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: HashMap::new(),
        }
    }

    /// Registers a transport under its own [`AnchorTransport::kind`].
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn AnchorTransport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Maps a requested anchor tag onto the type that will be attempted.
    /// Unknown tags resolve to [`AnchorType::None`] with a note; they are
    /// never stored verbatim.
    #[must_use]
    pub fn resolve(&self, requested: &str) -> (AnchorType, Option<String>) {
        match AnchorType::parse(requested) {
            Some(kind) => (kind, None),
            None => (
                AnchorType::None,
                Some(format!(
                    "unknown anchor type '{requested}'; recorded without anchor"
                )),
            ),
        }
    }

    /// Submits `hash_hex` for anchoring under `requested`.
    ///
    /// [`AnchorType::None`] is terminal immediately. A requested type with no
    /// registered transport, or a transport failure, degrades the outcome to
    /// an unanchored record carrying a note; this method itself never fails.
    pub async fn submit(&self, requested: AnchorType, hash_hex: &str) -> AnchorOutcome {
        if requested == AnchorType::None {
            return AnchorOutcome {
                effective: AnchorType::None,
                reference: None,
                proof: None,
                anchored_at: Some(Utc::now()),
                pending: false,
                note: None,
            };
        }

        let Some(transport) = self.transports.get(&requested) else {
            return degraded(format!(
                "anchor type '{}' is not available on this deployment; recorded without anchor",
                requested.as_str()
            ));
        };

        match transport.submit(hash_hex).await {
            Ok(proof) => AnchorOutcome {
                effective: requested,
                reference: Some(format!("{}:{hash_hex}", requested.as_str())),
                proof: Some(proof),
                anchored_at: None,
                pending: true,
                note: None,
            },
            Err(error) => {
                warn!(
                    anchor_type = requested.as_str(),
                    error = %error,
                    "anchor submission failed, degrading to unanchored record"
                );
                degraded(format!(
                    "anchoring via '{}' unavailable ({error}); recorded without anchor",
                    requested.as_str()
                ))
            },
        }
    }

    /// Attempts to upgrade a pending proof of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transport is missing or the
    /// upgrade command fails; the caller decides whether to retry.
    pub async fn upgrade(
        &self,
        kind: AnchorType,
        proof: &[u8],
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let transport =
            self.transports
                .get(&kind)
                .ok_or_else(|| TransportError::Unavailable {
                    message: format!("no transport registered for '{}'", kind.as_str()),
                })?;
        transport.upgrade(proof).await
    }
}

impl Default for AnchorService {
    fn default() -> Self {
        Self::new()
    }
}

fn degraded(note: String) -> AnchorOutcome {
    AnchorOutcome {
        effective: AnchorType::None,
        reference: None,
        proof: None,
        anchored_at: Some(Utc::now()),
        pending: false,
        note: Some(note),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AnchorTransport for FlakyTransport {
        fn kind(&self) -> AnchorType {
            AnchorType::Ots
        }

        async fn submit(&self, hash_hex: &str) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError::Failed {
                    message: "stamp rejected".to_string(),
                })
            } else {
                Ok(format!("proof:{hash_hex}").into_bytes())
            }
        }

        async fn upgrade(&self, _proof: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn none_request_is_terminal_without_transport_calls() {
        let transport = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let service = AnchorService::new().with_transport(transport.clone());

        let outcome = service.submit(AnchorType::None, "abc").await;
        assert_eq!(outcome.effective, AnchorType::None);
        assert!(!outcome.pending);
        assert!(outcome.anchored_at.is_some());
        assert!(outcome.note.is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_submission_is_pending_with_proof() {
        let service = AnchorService::new().with_transport(Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail: false,
        }));

        let outcome = service.submit(AnchorType::Ots, "deadbeef").await;
        assert_eq!(outcome.effective, AnchorType::Ots);
        assert!(outcome.pending);
        assert!(outcome.anchored_at.is_none());
        assert_eq!(outcome.proof.as_deref(), Some(b"proof:deadbeef".as_ref()));
        assert_eq!(outcome.reference.as_deref(), Some("ots:deadbeef"));
    }

    #[tokio::test]
    async fn transport_failure_degrades_with_note() {
        let service = AnchorService::new().with_transport(Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail: true,
        }));

        let outcome = service.submit(AnchorType::Ots, "deadbeef").await;
        assert_eq!(outcome.effective, AnchorType::None);
        assert!(!outcome.pending);
        assert!(outcome.proof.is_none());
        let note = outcome.note.expect("degradation note");
        assert!(note.contains("recorded without anchor"));
    }

    #[tokio::test]
    async fn unregistered_type_degrades_with_note() {
        let service = AnchorService::new();
        let outcome = service.submit(AnchorType::Merkle, "deadbeef").await;
        assert_eq!(outcome.effective, AnchorType::None);
        assert!(outcome.note.unwrap().contains("not available"));
    }

    #[test]
    fn unknown_tag_resolves_to_none_with_note() {
        let service = AnchorService::new();
        let (kind, note) = service.resolve("blockchain-9000");
        assert_eq!(kind, AnchorType::None);
        assert!(note.unwrap().contains("unknown anchor type"));

        let (kind, note) = service.resolve("ots");
        assert_eq!(kind, AnchorType::Ots);
        assert!(note.is_none());
    }
}

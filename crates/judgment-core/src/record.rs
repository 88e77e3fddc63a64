//! Record, anchor, and create-boundary types.
//!
//! A [`Record`] is created once at submission time and is immutable afterwards
//! with one exception: the proof-upgrade worker may set `anchor_proof` and
//! `anchor_processed_at` exactly once when the anchor reaches its terminal
//! confirmed state.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::pricing::NextTierInfo;

/// Closed set of anchoring backends.
///
/// `Merkle` and `TrustedTimestamp` are accepted on the wire but have no
/// implementation yet; the anchor service degrades them to `None` with a
/// diagnostic note. Unknown tags never reach this enum: [`AnchorType::parse`]
/// returns `Option::None` for them and the caller maps that to
/// [`AnchorType::None`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    /// No anchor. Immediately terminal.
    None,
    /// OpenTimestamps external timestamp proof.
    Ots,
    /// Merkle batch anchor (not implemented).
    Merkle,
    /// RFC 3161 trusted timestamp (not implemented).
    TrustedTimestamp,
}

impl AnchorType {
    /// Parses a wire tag. Returns `Option::None` for unknown tags so the
    /// caller can degrade explicitly rather than by fallthrough.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "none" => Some(Self::None),
            "ots" => Some(Self::Ots),
            "merkle" => Some(Self::Merkle),
            "trusted_timestamp" => Some(Self::TrustedTimestamp),
            _ => None,
        }
    }

    /// The wire tag for this anchor type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ots => "ots",
            Self::Merkle => "merkle",
            Self::TrustedTimestamp => "trusted_timestamp",
        }
    }

    /// Whether this anchor type is metered and charged.
    #[must_use]
    pub const fn is_billable(self) -> bool {
        matches!(self, Self::Ots)
    }
}

impl std::fmt::Display for AnchorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tamper-evident judgment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier (`jgd_` prefix).
    pub id: String,
    /// The actor the event is about.
    pub entity: String,
    /// The action that was judged.
    pub action: String,
    /// Arbitrary nested structured payload (depth- and size-bounded at the
    /// validation boundary).
    pub scope: Value,
    /// Event time supplied by the caller (or the recording time when absent).
    pub timestamp: DateTime<Utc>,
    /// Server-assigned recording time.
    pub recorded_at: DateTime<Utc>,
    /// Effective anchor type after any degradation.
    pub anchor_type: AnchorType,
    /// Backend-specific reference, when the backend provides one.
    pub anchor_reference: Option<String>,
    /// Opaque proof blob from the anchor transport.
    pub anchor_proof: Option<Vec<u8>>,
    /// Set exactly once when the anchor reaches its terminal confirmed state.
    pub anchor_processed_at: Option<DateTime<Utc>>,
    /// Client-supplied dedup token, unique when present.
    pub idempotency_key: Option<String>,
}

/// The content fields of a record that participate in hashing.
///
/// Timestamps are carried as RFC 3339 strings so the hash input has one fixed
/// encoding independent of any datetime formatting settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContent {
    pub entity: String,
    pub action: String,
    pub scope: Value,
    pub timestamp: String,
    pub recorded_at: String,
}

impl RecordContent {
    /// Builds the hash input from a record, excluding its id.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        Self {
            entity: record.entity.clone(),
            action: record.action.clone(),
            scope: record.scope.clone(),
            timestamp: rfc3339(record.timestamp),
            recorded_at: rfc3339(record.recorded_at),
        }
    }

    /// The JSON value that is canonicalized and hashed. Deliberately has no
    /// `id` field.
    #[must_use]
    pub fn to_hash_input(&self) -> Value {
        json!({
            "entity": self.entity,
            "action": self.action,
            "scope": self.scope,
            "timestamp": self.timestamp,
            "recorded_at": self.recorded_at,
        })
    }
}

/// Formats a timestamp the way record hashing and storage expect it.
#[must_use]
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Create-record request, as consumed from the (excluded) HTTP layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRequest {
    pub entity: String,
    pub action: String,
    #[serde(default)]
    pub scope: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub immutability: Option<ImmutabilityRequest>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Requested immutability anchoring.
#[derive(Debug, Clone, Deserialize)]
pub struct ImmutabilityRequest {
    /// Anchor type tag. Unknown tags degrade to `none`.
    #[serde(rename = "type")]
    pub anchor_type: String,
    /// Backend-specific options (currently unused by every backend).
    #[serde(default)]
    pub options: Option<Value>,
}

/// Create-record response.
#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub immutability_anchor: AnchorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Informational anchor sub-object. Anchoring status is reported here and is
/// never the cause of an overall request failure.
#[derive(Debug, Clone, Serialize)]
pub struct AnchorInfo {
    #[serde(rename = "type")]
    pub anchor_type: AnchorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Billing summary attached when an anchor was metered.
#[derive(Debug, Clone, Serialize)]
pub struct BillingInfo {
    pub charged: Decimal,
    pub tier: String,
    pub current_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_tier: Option<NextTierInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_tags() {
        assert_eq!(AnchorType::parse("none"), Some(AnchorType::None));
        assert_eq!(AnchorType::parse("ots"), Some(AnchorType::Ots));
        assert_eq!(AnchorType::parse("merkle"), Some(AnchorType::Merkle));
        assert_eq!(
            AnchorType::parse("trusted_timestamp"),
            Some(AnchorType::TrustedTimestamp)
        );
    }

    #[test]
    fn parse_unknown_tag_is_none_option() {
        assert_eq!(AnchorType::parse("blockchain"), None);
        assert_eq!(AnchorType::parse(""), None);
        assert_eq!(AnchorType::parse("OTS"), None);
    }

    #[test]
    fn only_ots_is_billable() {
        assert!(AnchorType::Ots.is_billable());
        assert!(!AnchorType::None.is_billable());
        assert!(!AnchorType::Merkle.is_billable());
        assert!(!AnchorType::TrustedTimestamp.is_billable());
    }

    #[test]
    fn hash_input_has_exactly_the_content_fields() {
        let content = RecordContent {
            entity: "e".into(),
            action: "a".into(),
            scope: serde_json::json!({}),
            timestamp: "2026-01-01T00:00:00.000Z".into(),
            recorded_at: "2026-01-01T00:00:01.000Z".into(),
        };
        let input = content.to_hash_input();
        let obj = input.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        assert!(obj.contains_key("entity"));
        assert!(obj.contains_key("recorded_at"));
        assert!(!obj.contains_key("id"));
    }
}

//! Create-request validation.
//!
//! Malformed input is rejected here, before any side effect: no hash is
//! computed, no balance is touched, no transport is invoked, nothing is
//! persisted. Limits follow the public API contract: bounded entity/action
//! lengths, a bounded idempotency key, and a depth- and size-bounded scope
//! payload.

use serde_json::Value;
use thiserror::Error;

use crate::record::CreateRequest;

/// Validation failures. Each variant names the offending field and bound.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A string field exceeds its maximum length.
    #[error("{field} must be at most {max} characters, got {actual}")]
    FieldTooLong {
        /// Name of the field.
        field: &'static str,
        /// Maximum permitted length.
        max: usize,
        /// Observed length.
        actual: usize,
    },

    /// The scope payload is nested too deeply.
    #[error("scope nesting too deep (max {max_depth} levels)")]
    ScopeTooDeep {
        /// Maximum permitted nesting depth.
        max_depth: usize,
    },

    /// The serialized scope payload is too large.
    #[error("scope too large: {actual_bytes} bytes exceeds {max_bytes} bytes")]
    ScopeTooLarge {
        /// Maximum permitted serialized size.
        max_bytes: usize,
        /// Observed serialized size.
        actual_bytes: usize,
    },
}

/// Bounds applied to create requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Maximum entity length in characters.
    pub max_entity_len: usize,
    /// Maximum action length in characters.
    pub max_action_len: usize,
    /// Maximum idempotency key length in characters.
    pub max_idempotency_key_len: usize,
    /// Maximum scope nesting depth.
    pub max_scope_depth: usize,
    /// Maximum serialized scope size in bytes.
    pub max_scope_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_entity_len: 255,
            max_action_len: 100,
            max_idempotency_key_len: 64,
            max_scope_depth: 5,
            max_scope_bytes: 100 * 1024,
        }
    }
}

/// Validates a create request against the configured limits.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered. Validation has no side
/// effects.
pub fn validate_create_request(
    request: &CreateRequest,
    limits: &RequestLimits,
) -> Result<(), ValidationError> {
    require_bounded("entity", &request.entity, limits.max_entity_len)?;
    require_bounded("action", &request.action, limits.max_action_len)?;

    if let Some(key) = &request.idempotency_key {
        if key.is_empty() {
            return Err(ValidationError::MissingField {
                field: "idempotency_key",
            });
        }
        if key.chars().count() > limits.max_idempotency_key_len {
            return Err(ValidationError::FieldTooLong {
                field: "idempotency_key",
                max: limits.max_idempotency_key_len,
                actual: key.chars().count(),
            });
        }
    }

    if let Some(scope) = &request.scope {
        let serialized = scope.to_string();
        if serialized.len() > limits.max_scope_bytes {
            return Err(ValidationError::ScopeTooLarge {
                max_bytes: limits.max_scope_bytes,
                actual_bytes: serialized.len(),
            });
        }
        check_depth(scope, 0, limits.max_scope_depth)?;
    }

    Ok(())
}

fn require_bounded(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::FieldTooLong { field, max, actual });
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize, max_depth: usize) -> Result<(), ValidationError> {
    if depth > max_depth {
        return Err(ValidationError::ScopeTooDeep { max_depth });
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1, max_depth)?;
            }
            Ok(())
        },
        Value::Object(map) => {
            for item in map.values() {
                check_depth(item, depth + 1, max_depth)?;
            }
            Ok(())
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request() -> CreateRequest {
        CreateRequest {
            entity: "alice@example.com".to_string(),
            action: "approved".to_string(),
            ..CreateRequest::default()
        }
    }

    #[test]
    fn accepts_minimal_request() {
        assert_eq!(
            validate_create_request(&request(), &RequestLimits::default()),
            Ok(())
        );
    }

    #[test]
    fn rejects_empty_entity() {
        let mut req = request();
        req.entity = String::new();
        assert_eq!(
            validate_create_request(&req, &RequestLimits::default()),
            Err(ValidationError::MissingField { field: "entity" })
        );
    }

    #[test]
    fn rejects_overlong_action() {
        let mut req = request();
        req.action = "x".repeat(101);
        assert!(matches!(
            validate_create_request(&req, &RequestLimits::default()),
            Err(ValidationError::FieldTooLong {
                field: "action",
                max: 100,
                actual: 101
            })
        ));
    }

    #[test]
    fn rejects_overlong_idempotency_key() {
        let mut req = request();
        req.idempotency_key = Some("k".repeat(65));
        assert!(matches!(
            validate_create_request(&req, &RequestLimits::default()),
            Err(ValidationError::FieldTooLong {
                field: "idempotency_key",
                ..
            })
        ));
    }

    #[test]
    fn rejects_deep_scope() {
        let mut scope = json!("leaf");
        for _ in 0..7 {
            scope = json!({ "nested": scope });
        }
        let mut req = request();
        req.scope = Some(scope);
        assert_eq!(
            validate_create_request(&req, &RequestLimits::default()),
            Err(ValidationError::ScopeTooDeep { max_depth: 5 })
        );
    }

    #[test]
    fn accepts_scope_at_depth_limit() {
        let mut scope = json!("leaf");
        for _ in 0..4 {
            scope = json!({ "nested": scope });
        }
        let mut req = request();
        req.scope = Some(scope);
        assert_eq!(
            validate_create_request(&req, &RequestLimits::default()),
            Ok(())
        );
    }

    #[test]
    fn rejects_oversized_scope() {
        let mut req = request();
        req.scope = Some(json!({ "blob": "x".repeat(101 * 1024) }));
        assert!(matches!(
            validate_create_request(&req, &RequestLimits::default()),
            Err(ValidationError::ScopeTooLarge { .. })
        ));
    }
}

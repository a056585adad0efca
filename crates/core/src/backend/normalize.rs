//! Normalization of backend responses into the canonical schema.
//!
//! Backends answer with camelCase or snake_case fields, optionally wrapped in a
//! `data` / `paymentIntent` envelope, and with provider status vocabularies.
//! Everything is folded into [`BackendIntent`] / [`ConnectionToken`] here so no
//! caller ever sees the raw shapes.

use serde::Deserialize;
use serde_json::Value;

use crate::payment::IntentStatus;

use super::{BackendError, BackendIntent, ConnectionToken};

const ENVELOPE_KEYS: [&str; 4] = ["data", "paymentIntent", "payment_intent", "result"];

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(alias = "intentId", alias = "intent_id", alias = "paymentIntentId")]
    id: String,
    #[serde(default, alias = "clientSecret")]
    client_secret: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(
        default,
        alias = "amountCaptured",
        alias = "amount_received",
        alias = "amountReceived"
    )]
    amount_captured: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawToken {
    #[serde(alias = "connectionToken", alias = "connection_token", alias = "token")]
    secret: String,
}

#[derive(Debug, Deserialize)]
struct RawErrorDetail {
    #[serde(default, alias = "type", alias = "errorCode", alias = "error_code")]
    code: Option<String>,
    #[serde(default, alias = "error_description", alias = "detail")]
    message: Option<String>,
}

/// Strip known envelopes until the payload object is reached.
fn unwrap_envelope(mut value: Value) -> Value {
    loop {
        let inner = match value.as_object() {
            Some(obj) => ENVELOPE_KEYS
                .iter()
                .find_map(|key| obj.get(*key).filter(|v| v.is_object()).cloned()),
            None => None,
        };
        match inner {
            Some(next) => value = next,
            None => return value,
        }
    }
}

/// Convert `camelCase` / `kebab-case` / `UPPER` status spellings to snake_case.
fn to_snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for (i, ch) in input.trim().chars().enumerate() {
        if ch == '-' || ch == ' ' {
            out.push('_');
        } else if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') && input.chars().any(|c| c.is_ascii_lowercase()) {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Map a provider status onto the intent lifecycle.
pub fn parse_intent_status(raw: &str) -> Option<IntentStatus> {
    match to_snake_case(raw).as_str() {
        "created" | "requires_payment_method" | "requires_confirmation" => {
            Some(IntentStatus::Created)
        }
        "collecting" | "requires_action" | "processing" => Some(IntentStatus::Collecting),
        "authorized" | "requires_capture" => Some(IntentStatus::Authorized),
        "captured" | "succeeded" => Some(IntentStatus::Captured),
        "cancelled" | "canceled" => Some(IntentStatus::Cancelled),
        "failed" => Some(IntentStatus::Failed),
        _ => None,
    }
}

/// Normalize a payment intent payload. `default_status` applies when the
/// backend omits the status field.
pub fn normalize_intent(
    value: Value,
    default_status: IntentStatus,
) -> Result<BackendIntent, BackendError> {
    let payload = unwrap_envelope(value);
    let raw: RawIntent = serde_json::from_value(payload)
        .map_err(|e| BackendError::InvalidResponse(format!("payment intent: {}", e)))?;

    let status = match raw.status.as_deref() {
        Some(s) => parse_intent_status(s)
            .ok_or_else(|| BackendError::InvalidResponse(format!("unknown status '{}'", s)))?,
        None => default_status,
    };

    Ok(BackendIntent {
        id: raw.id,
        client_secret: raw.client_secret.filter(|s| !s.is_empty()),
        status,
        amount: raw.amount,
        amount_captured: raw.amount_captured,
    })
}

/// Normalize a connection token payload.
pub fn normalize_token(value: Value) -> Result<ConnectionToken, BackendError> {
    let payload = unwrap_envelope(value);
    let raw: RawToken = serde_json::from_value(payload)
        .map_err(|e| BackendError::InvalidResponse(format!("connection token: {}", e)))?;
    if raw.secret.is_empty() {
        return Err(BackendError::InvalidResponse(
            "connection token is empty".to_string(),
        ));
    }
    Ok(ConnectionToken::new(raw.secret))
}

/// Turn a non-2xx client error body into a rejection.
pub fn parse_rejection(status: u16, body: &str) -> BackendError {
    let fallback = || BackendError::Rejected {
        status,
        code: None,
        message: if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            body.chars().take(200).collect()
        },
    };

    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return fallback();
    };

    let detail = match value.get("error") {
        Some(Value::String(message)) => {
            let code = value
                .get("code")
                .and_then(Value::as_str)
                .map(String::from);
            return BackendError::Rejected {
                status,
                code,
                message: message.clone(),
            };
        }
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => value,
    };

    match serde_json::from_value::<RawErrorDetail>(detail) {
        Ok(RawErrorDetail {
            code,
            message: Some(message),
        }) => BackendError::Rejected {
            status,
            code,
            message,
        },
        Ok(RawErrorDetail {
            code: Some(code),
            message: None,
        }) => BackendError::Rejected {
            status,
            message: code.clone(),
            code: Some(code),
        },
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snake_case_intent() {
        let intent = normalize_intent(
            json!({"id": "pi_1", "client_secret": "pi_1_secret", "status": "requires_payment_method"}),
            IntentStatus::Created,
        )
        .unwrap();
        assert_eq!(intent.id, "pi_1");
        assert_eq!(intent.client_secret.as_deref(), Some("pi_1_secret"));
        assert_eq!(intent.status, IntentStatus::Created);
    }

    #[test]
    fn test_camel_case_intent_in_envelope() {
        let intent = normalize_intent(
            json!({"data": {"paymentIntent": {
                "intentId": "pi_2",
                "clientSecret": "pi_2_secret",
                "status": "requiresCapture",
                "amount": 1000
            }}}),
            IntentStatus::Created,
        )
        .unwrap();
        assert_eq!(intent.id, "pi_2");
        assert_eq!(intent.status, IntentStatus::Authorized);
        assert_eq!(intent.amount, Some(1000));
    }

    #[test]
    fn test_missing_status_uses_default() {
        let intent = normalize_intent(json!({"id": "pi_3"}), IntentStatus::Cancelled).unwrap();
        assert_eq!(intent.status, IntentStatus::Cancelled);
        assert!(intent.client_secret.is_none());
    }

    #[test]
    fn test_amount_received_alias() {
        let intent = normalize_intent(
            json!({"id": "pi_4", "status": "succeeded", "amount_received": 900}),
            IntentStatus::Created,
        )
        .unwrap();
        assert_eq!(intent.status, IntentStatus::Captured);
        assert_eq!(intent.amount_captured, Some(900));
    }

    #[test]
    fn test_unknown_status_is_invalid_response() {
        let err = normalize_intent(
            json!({"id": "pi_5", "status": "teleported"}),
            IntentStatus::Created,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn test_missing_id_is_invalid_response() {
        let err = normalize_intent(json!({"status": "created"}), IntentStatus::Created).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(parse_intent_status("canceled"), Some(IntentStatus::Cancelled));
        assert_eq!(parse_intent_status("CANCELLED"), Some(IntentStatus::Cancelled));
        assert_eq!(parse_intent_status("requires-capture"), Some(IntentStatus::Authorized));
        assert_eq!(parse_intent_status("processing"), Some(IntentStatus::Collecting));
        assert_eq!(parse_intent_status("Succeeded"), Some(IntentStatus::Captured));
        assert_eq!(parse_intent_status("refunded"), None);
    }

    #[test]
    fn test_token_variants() {
        assert_eq!(normalize_token(json!({"secret": "a"})).unwrap().secret, "a");
        assert_eq!(
            normalize_token(json!({"data": {"connectionToken": "b"}}))
                .unwrap()
                .secret,
            "b"
        );
        assert!(normalize_token(json!({"secret": ""})).is_err());
        assert!(normalize_token(json!({"nope": 1})).is_err());
    }

    #[test]
    fn test_rejection_nested_error() {
        let err = parse_rejection(
            402,
            r#"{"error": {"code": "card_declined", "message": "Your card was declined."}}"#,
        );
        assert_eq!(
            err,
            BackendError::Rejected {
                status: 402,
                code: Some("card_declined".to_string()),
                message: "Your card was declined.".to_string(),
            }
        );
    }

    #[test]
    fn test_rejection_flat_and_string_forms() {
        let flat = parse_rejection(400, r#"{"code": "invalid_tenant", "message": "unknown tenant"}"#);
        assert!(matches!(
            flat,
            BackendError::Rejected { code: Some(ref c), .. } if c == "invalid_tenant"
        ));

        let string_form = parse_rejection(401, r#"{"error": "unauthorized"}"#);
        assert!(matches!(
            string_form,
            BackendError::Rejected { status: 401, ref message, .. } if message == "unauthorized"
        ));

        let plain = parse_rejection(404, "not found");
        assert!(matches!(
            plain,
            BackendError::Rejected { ref message, .. } if message == "not found"
        ));

        let empty = parse_rejection(409, "");
        assert!(matches!(
            empty,
            BackendError::Rejected { ref message, .. } if message == "HTTP 409"
        ));
    }
}

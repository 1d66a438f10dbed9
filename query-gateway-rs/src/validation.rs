//! Query Gateway Input Validation
//!
//! Request validation and sanitization for the chat endpoints. Everything
//! here runs before a dispatch plan is created, so a rejected request never
//! reaches a domain service.

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use jsonschema::{Draft, JSONSchema};
use regex::Regex;
use serde_json::{json, Value};

use crate::error::ErrorResponse;
use crate::models::ChatRequest;

/// Default maximum request payload size (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

lazy_static::lazy_static! {
    /// Schema for the chat request body
    pub static ref CHAT_REQUEST_SCHEMA: JSONSchema = {
        let schema = json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 8000
                },
                "conversation_id": {
                    "type": ["string", "null"],
                    "maxLength": 128,
                    "pattern": "^[A-Za-z0-9_.:-]*$"
                },
                "tags": {
                    "type": "array",
                    "maxItems": 32,
                    "items": {
                        "type": "string",
                        "minLength": 1,
                        "maxLength": 64
                    }
                }
            },
            "additionalProperties": false
        });

        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .expect("Invalid schema")
    };

    static ref USER_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("Invalid regex");
}

/// Validation error for API requests
#[derive(Debug, thiserror::Error)]
pub enum ApiValidationError {
    #[error("Invalid request format: {0}")]
    InvalidFormat(String),

    #[error("Content type must be {0}")]
    ContentType(String),

    #[error("Request payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Schema validation error")]
    Schema(Vec<String>),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Message is empty after sanitization")]
    EmptyMessage,
}

impl ApiValidationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidFormat(_)
            | Self::Schema(_)
            | Self::InvalidUserId(_)
            | Self::EmptyMessage => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "INVALID_FORMAT",
            Self::ContentType(_) => "UNSUPPORTED_CONTENT_TYPE",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Schema(_) => "SCHEMA_VIOLATION",
            Self::InvalidUserId(_) => "INVALID_USER_ID",
            Self::EmptyMessage => "EMPTY_MESSAGE",
        }
    }

    pub fn details(&self) -> Option<Vec<String>> {
        match self {
            Self::Schema(details) if !details.is_empty() => Some(details.clone()),
            _ => None,
        }
    }

    /// Convert to HTTP status code and error response
    pub fn to_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        let status = self.status_code();
        (status, Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            kind: self.kind().to_string(),
            details: self.details(),
        }))
    }
}

/// Validate the Content-Type header
pub fn validate_content_type(headers: &HeaderMap, expected: &str) -> Result<(), ApiValidationError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !content_type.starts_with(expected) {
        return Err(ApiValidationError::ContentType(
            format!("'{}', got '{}'", expected, content_type)
        ));
    }

    Ok(())
}

/// User ids are path segments forwarded to domain services
pub fn validate_user_id(user_id: &str) -> Result<(), ApiValidationError> {
    if USER_ID_PATTERN.is_match(user_id) {
        Ok(())
    } else {
        Err(ApiValidationError::InvalidUserId(
            "must be 1-64 characters of letters, digits, '_', '.' or '-'".to_string()
        ))
    }
}

/// Validate a chat body against [`CHAT_REQUEST_SCHEMA`]
pub fn validate_json_schema(json: &Value) -> Result<(), ApiValidationError> {
    if let Err(errors) = CHAT_REQUEST_SCHEMA.validate(json) {
        let details: Vec<String> = errors
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{} at {}", err, path)
                }
            })
            .collect();
        return Err(ApiValidationError::Schema(details));
    }

    Ok(())
}

/// Size check and JSON parse of a raw body
pub fn sanitize_json_input(body: &[u8], limit: usize) -> Result<Value, ApiValidationError> {
    if body.len() > limit {
        return Err(ApiValidationError::PayloadTooLarge(
            format!("Payload size ({} bytes) exceeds maximum allowed size ({} bytes)", body.len(), limit)
        ));
    }

    let text = std::str::from_utf8(body)
        .map_err(|_| ApiValidationError::InvalidFormat("Request body is not valid UTF-8".to_string()))?;

    serde_json::from_str::<Value>(text.trim())
        .map_err(|e| ApiValidationError::InvalidFormat(format!("Invalid JSON: {}", e)))
}

/// Strips control characters other than newline and tab, and null bytes
pub fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Full validation pipeline for a chat body
pub fn parse_chat_request(body: &[u8], limit: usize) -> Result<ChatRequest, ApiValidationError> {
    let value = sanitize_json_input(body, limit)?;
    validate_json_schema(&value)?;

    let mut request: ChatRequest = serde_json::from_value(value)
        .map_err(|e| ApiValidationError::InvalidFormat(e.to_string()))?;

    request.message = sanitize_message(&request.message);
    if request.message.is_empty() {
        return Err(ApiValidationError::EmptyMessage);
    }

    request.conversation_id = request
        .conversation_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    request.tags = request
        .tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_validate_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json; charset=utf-8"));

        assert!(validate_content_type(&headers, "application/json").is_ok());
        assert!(validate_content_type(&headers, "application/xml").is_err());
        assert!(validate_content_type(&HeaderMap::new(), "application/json").is_err());
    }

    #[test]
    fn test_validate_json_schema() {
        let valid = json!({
            "message": "What does BRCA1 do?",
            "conversation_id": "c-123",
            "tags": ["gene"]
        });
        let missing_message = json!({"conversation_id": "c-123"});
        let extra_field = json!({"message": "hi", "method": "x"});
        let bad_conversation = json!({"message": "hi", "conversation_id": "../../etc"});

        assert!(validate_json_schema(&valid).is_ok());
        assert!(validate_json_schema(&missing_message).is_err());
        assert!(validate_json_schema(&extra_field).is_err());
        assert!(validate_json_schema(&bad_conversation).is_err());
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("user_42").is_ok());
        assert!(validate_user_id("a.b-c").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("has space").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_parse_chat_request_sanitizes() {
        let body = br#"{"message": "  BRCA1\u0000 risk\u0007 \n", "conversation_id": "", "tags": [" Gene "]}"#;
        let request = parse_chat_request(body, MAX_PAYLOAD_SIZE).unwrap();

        assert_eq!(request.message, "BRCA1 risk");
        assert_eq!(request.conversation_id, None);
        assert_eq!(request.tags, vec!["gene".to_string()]);
    }

    #[test]
    fn test_parse_chat_request_rejects() {
        assert!(matches!(
            parse_chat_request(b"{not json", MAX_PAYLOAD_SIZE),
            Err(ApiValidationError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_chat_request(br#"{"message": "\u0001\u0002"}"#, MAX_PAYLOAD_SIZE),
            Err(ApiValidationError::EmptyMessage)
        ));
        assert!(matches!(
            parse_chat_request(br#"{"message": "hello"}"#, 4),
            Err(ApiValidationError::PayloadTooLarge(_))
        ));

        let err = parse_chat_request(br#"{"message": 5}"#, MAX_PAYLOAD_SIZE).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.details().is_some());
    }
}

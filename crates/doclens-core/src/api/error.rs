use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// A validation message attributed to one request field, when the backend says which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: Option<String>,
    pub message: String,
}

/// Every failure the API client reports. `Display` is the user-facing message.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        status: StatusCode,
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("{message}")]
    Server { status: StatusCode, message: String },

    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("Unable to reach the server. Check your connection.")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Separator used when several validation messages are reported at once
const MESSAGE_SEPARATOR: &str = ", ";

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<Detail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Detail {
    Text(String),
    Items(Vec<DetailItem>),
    Other(serde::de::IgnoredAny),
}

#[derive(Deserialize)]
struct DetailItem {
    #[serde(default)]
    loc: Vec<serde_json::Value>,
    msg: String,
}

impl DetailItem {
    /// The innermost named location, skipping the request-part prefix (`body`, `query`, ...).
    fn field(&self) -> Option<String> {
        self.loc
            .iter()
            .rev()
            .filter_map(|part| part.as_str())
            .find(|part| !matches!(*part, "body" | "query" | "path" | "header" | "form"))
            .map(str::to_string)
    }
}

/// Message and per-field data extracted from an error body.
struct ParsedBody {
    message: Option<String>,
    fields: Vec<FieldError>,
}

impl ParsedBody {
    fn parse(body: &str) -> Self {
        let empty = ParsedBody {
            message: None,
            fields: Vec::new(),
        };
        let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
            return empty;
        };

        match parsed.detail {
            Some(Detail::Text(text)) if !text.trim().is_empty() => ParsedBody {
                message: Some(text),
                fields: Vec::new(),
            },
            Some(Detail::Items(items)) if !items.is_empty() => {
                let fields: Vec<FieldError> = items
                    .iter()
                    .map(|item| FieldError {
                        field: item.field(),
                        message: item.msg.clone(),
                    })
                    .collect();
                let message = fields
                    .iter()
                    .map(|f| f.message.as_str())
                    .collect::<Vec<_>>()
                    .join(MESSAGE_SEPARATOR);
                ParsedBody {
                    message: Some(message),
                    fields,
                }
            }
            _ => ParsedBody {
                message: parsed.message.filter(|m| !m.trim().is_empty()),
                fields: Vec::new(),
            },
        }
    }
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    fn status_message(status: StatusCode) -> String {
        format!("Request failed with status {}", status)
    }

    /// Build the error for a non-2xx response from its status and raw body.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed = ParsedBody::parse(body);
        let message = parsed
            .message
            .unwrap_or_else(|| Self::status_message(status));

        match status.as_u16() {
            400 | 422 => ApiError::Validation {
                status,
                message,
                fields: parsed.fields,
            },
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Status { status, message },
        }
    }

    /// HTTP status behind this error, if a response was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Validation { status, .. }
            | ApiError::Server { status, .. }
            | ApiError::Status { status, .. } => Some(*status),
            ApiError::Unauthorized(_) => Some(StatusCode::UNAUTHORIZED),
            ApiError::AccessDenied(_) => Some(StatusCode::FORBIDDEN),
            ApiError::NotFound(_) => Some(StatusCode::NOT_FOUND),
            ApiError::RateLimited => Some(StatusCode::TOO_MANY_REQUESTS),
            ApiError::Network(e) => e.status(),
            ApiError::InvalidResponse(_) | ApiError::InvalidRequest(_) => None,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Per-field validation messages; empty unless the backend attributed them.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::Validation { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_string() {
        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"detail": "Incorrect username or password"}"#,
        );
        assert!(err.is_unauthorized());
        assert_eq!(err.message(), "Incorrect username or password");
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_detail_list_is_joined() {
        let body = r#"{"detail": [
            {"loc": ["body", "email"], "msg": "value is not a valid email address", "type": "value_error"},
            {"loc": ["body", "password"], "msg": "ensure this value has at least 8 characters"}
        ]}"#;
        let err = ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(
            err.message(),
            "value is not a valid email address, ensure this value has at least 8 characters"
        );
        let fields = err.field_errors();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field.as_deref(), Some("email"));
        assert_eq!(fields[1].field.as_deref(), Some("password"));
    }

    #[test]
    fn test_single_item_without_location() {
        let err = ApiError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"detail": [{"msg": "Email already registered"}]}"#,
        );
        assert_eq!(err.message(), "Email already registered");
        assert_eq!(err.field_errors()[0].field, None);
    }

    #[test]
    fn test_message_field() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, r#"{"message": "Not your folder"}"#);
        assert!(matches!(err, ApiError::AccessDenied(_)));
        assert_eq!(err.message(), "Not your folder");
    }

    #[test]
    fn test_unparseable_body_falls_back_to_status() {
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, "<html>upstream down</html>");
        assert_eq!(err.message(), "Request failed with status 502 Bad Gateway");
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));

        let err = ApiError::from_status(StatusCode::NOT_FOUND, "");
        assert!(err.is_not_found());
        assert_eq!(err.message(), "Request failed with status 404 Not Found");

        let err = ApiError::from_status(StatusCode::CONFLICT, r#"{"detail": {"code": 7}}"#);
        assert_eq!(err.message(), "Request failed with status 409 Conflict");
    }

    #[test]
    fn test_rate_limited() {
        let err = ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(err, ApiError::RateLimited));
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_truncate_body() {
        let short = "short body";
        assert_eq!(ApiError::truncate_body(short), short);

        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("(truncated, 800 total bytes)"));
    }
}

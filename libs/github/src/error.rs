//! Error taxonomy for the Actions backend client.
//!
//! The policy split the rest of the system relies on:
//!
//! - [`ActionsError::Api`] with a 4xx status other than 409 is terminal for
//!   the current operation ([`ActionsError::is_client_side`]).
//! - 409 is retryable with fixed spacing ([`ActionsError::is_conflict`]).
//! - [`ActionsError::QueueTokenExpired`] triggers a session refresh in the
//!   message-queue manager; nothing else reacts to it.
//! - Transport errors and 5xx responses are retried inside the HTTP layer
//!   before they ever surface here.

use reqwest::{Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionsError {
    /// Non-2xx answer from the backend, decoded from either a
    /// `{typeName, message}` JSON body or a `text/plain` body.
    #[error("{status} response from the Actions backend: {message}")]
    Api {
        status: StatusCode,
        type_name: Option<String>,
        message: String,
    },

    /// 401 from a message-queue endpoint; the body explains the expiry.
    #[error("message queue token expired: {0}")]
    QueueTokenExpired(String),

    /// Connection-level failure after the HTTP layer exhausted its retries.
    #[error("transport failure talking to the Actions backend: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credential flow (app JWT, installation token, admin exchange) failed.
    #[error("credential flow failed: {0}")]
    Auth(String),

    /// A token could not be minted or inspected.
    #[error("invalid token: {0}")]
    Token(String),

    /// URL construction or a malformed backend-provided URL.
    #[error("invalid URL: {0}")]
    Url(String),

    /// Responses that violate the endpoint contract (e.g. duplicate names).
    #[error("{0}")]
    Unexpected(String),
}

impl ActionsError {
    /// HTTP status of an API rejection, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ActionsError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 4xx rejections other than 409; these are never retried.
    pub fn is_client_side(&self) -> bool {
        match self.status() {
            Some(status) => status.is_client_error() && status != StatusCode::CONFLICT,
            None => false,
        }
    }

    /// True for 409, which session creation retries with fixed spacing.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default, rename = "typeName")]
    type_name: Option<String>,
    #[serde(default)]
    message: String,
}

/// Responses may carry a UTF-8 byte order mark before the JSON payload.
pub(crate) fn trim_bom(body: &[u8]) -> &[u8] {
    body.strip_prefix(b"\xef\xbb\xbf").unwrap_or(body)
}

/// Decode a non-2xx backend response into an [`ActionsError::Api`].
pub(crate) async fn error_from_response(response: Response) -> ActionsError {
    let status = response.status();
    let is_plain_text = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/plain"))
        .unwrap_or(false);

    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return ActionsError::Transport(err),
    };
    let body = trim_bom(&body);

    if body.is_empty() {
        return ActionsError::Api {
            status,
            type_name: Some("unknown".to_string()),
            message: format!("request returned status {status}"),
        };
    }

    if is_plain_text {
        return ActionsError::Api {
            status,
            type_name: None,
            message: String::from_utf8_lossy(body).into_owned(),
        };
    }

    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => ActionsError::Api {
            status,
            type_name: parsed.type_name,
            message: parsed.message,
        },
        Err(_) => ActionsError::Api {
            status,
            type_name: None,
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: StatusCode) -> ActionsError {
        ActionsError::Api {
            status,
            type_name: None,
            message: "nope".to_string(),
        }
    }

    #[test]
    fn test_client_side_classification() {
        assert!(api(StatusCode::BAD_REQUEST).is_client_side());
        assert!(api(StatusCode::NOT_FOUND).is_client_side());
        assert!(!api(StatusCode::CONFLICT).is_client_side());
        assert!(!api(StatusCode::INTERNAL_SERVER_ERROR).is_client_side());
        assert!(!ActionsError::QueueTokenExpired("expired".to_string()).is_client_side());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(api(StatusCode::CONFLICT).is_conflict());
        assert!(!api(StatusCode::BAD_REQUEST).is_conflict());
    }

    #[test]
    fn test_trim_bom() {
        assert_eq!(trim_bom(b"\xef\xbb\xbf{}"), b"{}");
        assert_eq!(trim_bom(b"{}"), b"{}");
        assert_eq!(trim_bom(b""), b"");
    }

    #[test]
    fn test_error_body_decoding() {
        let body: ApiErrorBody =
            serde_json::from_slice(b"{\"typeName\":\"SessionConflict\",\"message\":\"taken\"}")
                .unwrap();
        assert_eq!(body.type_name.as_deref(), Some("SessionConflict"));
        assert_eq!(body.message, "taken");
    }
}

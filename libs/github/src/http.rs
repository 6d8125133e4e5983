//! Shared HTTP plumbing: client construction, auth headers, and the
//! transport-level retry loop.
//!
//! Transport errors and 5xx responses are retried with exponential backoff,
//! at most [`MAX_RETRIES`] times with waits capped at 30 s. Everything else
//! is handed back to the caller untouched.

use std::time::Duration;

use bridge_retry::BackoffPolicy;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Request, Response};
use tracing::debug;

use crate::error::ActionsError;

/// Retries after the first attempt.
pub(crate) const MAX_RETRIES: u32 = 4;

/// Overall per-request deadline; generous because queue receives long-poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Build the shared reqwest client.
pub(crate) fn build_client() -> Result<Client, ActionsError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ActionsError::from)
}

pub(crate) fn retry_policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(30),
        jitter: 0.25,
    }
}

/// Standard headers for a Bearer-authenticated JSON request.
pub(crate) fn bearer_headers(token: &str) -> Result<HeaderMap, ActionsError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Headers for the runner-registration exchange, which authenticates with a
/// `RemoteAuth` scheme instead of `Bearer`.
pub(crate) fn remote_auth_headers(token: &str) -> Result<HeaderMap, ActionsError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&format!("RemoteAuth {token}"))?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Headers for message-queue receives, which pin the api version via Accept.
pub(crate) fn queue_receive_headers(token: &str) -> Result<HeaderMap, ActionsError> {
    let mut headers = bearer_headers(token)?;
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json; api-version=6.0-preview"),
    );
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, ActionsError> {
    HeaderValue::from_str(value)
        .map_err(|_| ActionsError::Token("token contains characters invalid in a header".into()))
}

/// Execute a request, retrying transport failures and 5xx responses.
///
/// The request body must be cloneable (all bodies here are buffered JSON);
/// when it is not, the request runs exactly once.
pub(crate) async fn send_with_retry(
    client: &Client,
    request: Request,
) -> Result<Response, ActionsError> {
    let policy = retry_policy();
    let mut attempt = 0u32;

    loop {
        let this_attempt = match request.try_clone() {
            Some(cloned) => cloned,
            None => return Ok(client.execute(request).await?),
        };

        match client.execute(this_attempt).await {
            Ok(response) if response.status().is_server_error() && attempt < MAX_RETRIES => {
                debug!(
                    status = %response.status(),
                    attempt,
                    url = %request.url(),
                    "server error, retrying request"
                );
            }
            Ok(response) => return Ok(response),
            Err(err) if attempt < MAX_RETRIES => {
                debug!(error = %err, attempt, url = %request.url(), "transport error, retrying request");
            }
            Err(err) => return Err(err.into()),
        }

        tokio::time::sleep(policy.delay(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_headers() {
        let headers = bearer_headers("abc").unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_remote_auth_headers() {
        let headers = remote_auth_headers("reg-token").unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "RemoteAuth reg-token");
    }

    #[test]
    fn test_queue_receive_headers_pin_api_version() {
        let headers = queue_receive_headers("tok").unwrap();
        assert_eq!(
            headers.get(ACCEPT).unwrap(),
            "application/json; api-version=6.0-preview"
        );
    }

    #[test]
    fn test_rejects_unprintable_tokens() {
        assert!(bearer_headers("bad\ntoken").is_err());
    }
}

//! Message-queue endpoints.
//!
//! These authenticate with the session's queue access token, not the admin
//! token, and have two protocol quirks of their own: a 202 on receive means
//! "long poll elapsed, nothing to deliver", and a 401 carries a body that is
//! the token-expired signal the queue manager reacts to.

use reqwest::{Client, Method, Response, StatusCode, Url};

use crate::client::API_VERSION;
use crate::error::{error_from_response, trim_bom, ActionsError};
use crate::http;
use crate::types::{Int64List, ScaleSetMessage};

/// Long-poll the queue for the next message.
///
/// `last_message_id` acknowledges the previous message so the backend can
/// advance its cursor; zero means "from the beginning".
pub(crate) async fn get_message(
    client: &Client,
    queue_url: &str,
    queue_token: &str,
    last_message_id: i64,
) -> Result<Option<ScaleSetMessage>, ActionsError> {
    let mut url = parse_queue_url(queue_url)?;
    if last_message_id > 0 {
        url.query_pairs_mut()
            .append_pair("lastMessageId", &last_message_id.to_string());
    }

    let request = client
        .request(Method::GET, url)
        .headers(http::queue_receive_headers(queue_token)?)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;

    match response.status() {
        StatusCode::ACCEPTED => Ok(None),
        status if status.is_success() => Ok(Some(response.json().await?)),
        _ => Err(queue_error(response).await),
    }
}

/// Delete a handled message. The backend answers 204; deleting an already
/// deleted id is not an error.
pub(crate) async fn delete_message(
    client: &Client,
    queue_url: &str,
    queue_token: &str,
    message_id: i64,
) -> Result<(), ActionsError> {
    let mut url = parse_queue_url(queue_url)?;
    let path = format!("{}/{message_id}", url.path().trim_end_matches('/'));
    url.set_path(&path);

    let request = client
        .request(Method::DELETE, url)
        .headers(http::bearer_headers(queue_token)?)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;

    match response.status() {
        StatusCode::NO_CONTENT => Ok(()),
        status if status.is_success() => Ok(()),
        _ => Err(queue_error(response).await),
    }
}

/// Claim available jobs by runner-request id.
pub(crate) async fn acquire_jobs(
    client: &Client,
    actions_service_url: &str,
    scale_set_id: i64,
    queue_token: &str,
    request_ids: &[i64],
) -> Result<Vec<i64>, ActionsError> {
    let url = format!(
        "{}/_apis/runtime/runnerscalesets/{scale_set_id}/acquirejobs?api-version={API_VERSION}",
        actions_service_url.trim_end_matches('/')
    );

    let request = client
        .request(Method::POST, &url)
        .headers(http::bearer_headers(queue_token)?)
        .json(request_ids)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;

    if !response.status().is_success() {
        return Err(queue_error(response).await);
    }

    let acquired: Int64List = response.json().await?;
    Ok(acquired.value)
}

fn parse_queue_url(queue_url: &str) -> Result<Url, ActionsError> {
    Url::parse(queue_url).map_err(|e| ActionsError::Url(format!("{queue_url}: {e}")))
}

/// 401 from any queue endpoint means the queue token expired; the body text
/// explains why and is preserved for logging.
async fn queue_error(response: Response) -> ActionsError {
    if response.status() != StatusCode::UNAUTHORIZED {
        return error_from_response(response).await;
    }

    match response.bytes().await {
        Ok(body) => {
            let message = String::from_utf8_lossy(trim_bom(&body)).into_owned();
            ActionsError::QueueTokenExpired(message)
        }
        Err(err) => ActionsError::Transport(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_url_rejects_garbage() {
        assert!(parse_queue_url("://nope").is_err());
        assert!(parse_queue_url("https://queue.example.com/_apis/q/1").is_ok());
    }

    #[test]
    fn test_delete_path_construction() {
        let mut url = parse_queue_url("https://queue.example.com/_apis/q/1").unwrap();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), 42);
        url.set_path(&path);
        assert_eq!(url.as_str(), "https://queue.example.com/_apis/q/1/42");
    }
}

//! Exchange an installation access token for Actions-service admin
//! credentials.
//!
//! Two hops: a runner registration token scoped to the org or repo, then the
//! `runner-registration` endpoint (authenticated with `RemoteAuth`) which
//! answers with the Actions service URL and an admin JWT for it.

use crate::config::{GitHubConfig, GitHubScope};
use crate::error::{error_from_response, ActionsError};
use crate::http;
use crate::types::{AccessToken, AuthorizationInfo, RegistrationPayload, RegistrationToken};

/// Resolve admin credentials for the Actions service behind `config`.
pub async fn fetch_authorization(
    client: &reqwest::Client,
    api_url: &str,
    config: &GitHubConfig,
    access_token: &AccessToken,
) -> Result<AuthorizationInfo, ActionsError> {
    let registration = fetch_registration_token(client, api_url, config, access_token).await?;

    let url = format!(
        "{}/actions/runner-registration",
        api_url.trim_end_matches('/')
    );
    let payload = RegistrationPayload {
        url: config.url.clone(),
        runner_event: "register".to_string(),
    };

    let request = client
        .post(&url)
        .headers(http::remote_auth_headers(&registration.token)?)
        .json(&payload)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    Ok(response.json().await?)
}

fn registration_token_path(api_url: &str, config: &GitHubConfig) -> String {
    let base = api_url.trim_end_matches('/');
    match config.scope {
        GitHubScope::Organization => format!(
            "{base}/orgs/{}/actions/runners/registration-token",
            config.organization
        ),
        GitHubScope::Repository => format!(
            "{base}/repos/{}/{}/actions/runners/registration-token",
            config.organization,
            config.repository.as_deref().unwrap_or_default()
        ),
    }
}

async fn fetch_registration_token(
    client: &reqwest::Client,
    api_url: &str,
    config: &GitHubConfig,
    access_token: &AccessToken,
) -> Result<RegistrationToken, ActionsError> {
    let url = registration_token_path(api_url, config);

    let mut headers = http::bearer_headers(&access_token.token)?;
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/vnd.github.v3+json"),
    );

    let request = client
        .post(&url)
        .headers(headers)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_path_for_organization() {
        let config = GitHubConfig::parse("https://github.com/acme").unwrap();
        assert_eq!(
            registration_token_path("https://api.github.com", &config),
            "https://api.github.com/orgs/acme/actions/runners/registration-token"
        );
    }

    #[test]
    fn test_registration_path_for_repository() {
        let config = GitHubConfig::parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(
            registration_token_path("https://api.github.com/", &config),
            "https://api.github.com/repos/acme/widgets/actions/runners/registration-token"
        );
    }

    #[test]
    fn test_registration_path_for_enterprise() {
        let config = GitHubConfig::parse("https://ghe.example.com/acme").unwrap();
        assert_eq!(
            registration_token_path("https://ghe.example.com/api/v3", &config),
            "https://ghe.example.com/api/v3/orgs/acme/actions/runners/registration-token"
        );
    }
}

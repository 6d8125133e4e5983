//! Authenticated client for the Actions backend.
//!
//! The client owns the admin-token lifecycle: it runs the App credential
//! flow once at construction, remembers the token's expiry, and re-runs the
//! flow under a mutex whenever a request finds the token within 60 s of
//! expiring. Concurrent refreshers coalesce behind that mutex.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::app;
use crate::auth;
use crate::config::GitHubConfig;
use crate::error::{error_from_response, ActionsError};
use crate::http;
use crate::types::{
    AcquirableJobList, JitRunnerConfig, JitRunnerSetting, RunnerReference, RunnerReferenceList,
    RunnerScaleSet, ScaleSetList, ScaleSetMessage, ScaleSetSession,
};

const SCALE_SET_ENDPOINT: &str = "_apis/runtime/runnerscalesets";
const RUNNER_ENDPOINT: &str = "_apis/distributedtask/pools/0/agents";
pub(crate) const API_VERSION: &str = "6.0-preview";

/// Refresh the admin token once it is this close to expiring.
const TOKEN_REFRESH_WINDOW_SECS: i64 = 60;

/// Capability set the rest of the system programs against.
#[async_trait]
pub trait ActionsApi: Send + Sync {
    async fn get_runner_scale_set(
        &self,
        runner_group_id: i64,
        name: &str,
    ) -> Result<Option<RunnerScaleSet>, ActionsError>;
    async fn create_runner_scale_set(
        &self,
        scale_set: &RunnerScaleSet,
    ) -> Result<RunnerScaleSet, ActionsError>;
    async fn delete_runner_scale_set(&self, scale_set_id: i64) -> Result<(), ActionsError>;

    async fn create_jit_runner(
        &self,
        scale_set_id: i64,
        runner_name: &str,
    ) -> Result<JitRunnerConfig, ActionsError>;
    async fn get_runner(&self, runner_name: &str)
        -> Result<Option<RunnerReference>, ActionsError>;
    async fn delete_runner(&self, runner_id: i64) -> Result<(), ActionsError>;

    async fn create_message_session(
        &self,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<ScaleSetSession, ActionsError>;
    async fn refresh_message_session(
        &self,
        scale_set_id: i64,
        session_id: &Uuid,
    ) -> Result<ScaleSetSession, ActionsError>;
    async fn delete_message_session(
        &self,
        scale_set_id: i64,
        session_id: &Uuid,
    ) -> Result<(), ActionsError>;

    async fn get_acquirable_jobs(
        &self,
        scale_set_id: i64,
    ) -> Result<AcquirableJobList, ActionsError>;

    async fn get_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ActionsError>;
    async fn delete_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        message_id: i64,
    ) -> Result<(), ActionsError>;
    async fn acquire_jobs(
        &self,
        scale_set_id: i64,
        queue_token: &str,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ActionsError>;
}

/// Inputs for the App credential flow.
#[derive(Debug, Clone)]
pub struct ActionsSettings {
    /// Public (or Enterprise `/api/v3`) API base URL.
    pub api_url: String,
    pub app_id: i64,
    pub installation_id: i64,
    pub private_key_pem: String,
}

#[derive(Debug, Clone)]
struct AuthState {
    actions_service_url: String,
    admin_token: String,
    expires_at: DateTime<Utc>,
}

pub struct ActionsClient {
    pub(crate) http: reqwest::Client,
    settings: ActionsSettings,
    github: GitHubConfig,
    auth: Mutex<AuthState>,
}

impl ActionsClient {
    /// Run the credential flow and build the client.
    pub async fn connect(
        settings: ActionsSettings,
        github: GitHubConfig,
    ) -> Result<Self, ActionsError> {
        let http = http::build_client()?;
        let state = Self::authorize(&http, &settings, &github).await?;

        Ok(Self {
            http,
            settings,
            github,
            auth: Mutex::new(state),
        })
    }

    async fn authorize(
        http: &reqwest::Client,
        settings: &ActionsSettings,
        github: &GitHubConfig,
    ) -> Result<AuthState, ActionsError> {
        let access_token = app::fetch_access_token(
            http,
            &settings.api_url,
            settings.app_id,
            settings.installation_id,
            &settings.private_key_pem,
        )
        .await?;

        let info = auth::fetch_authorization(http, &settings.api_url, github, &access_token).await?;
        let expires_at = app::token_expiration(&info.admin_token)?;

        Ok(AuthState {
            actions_service_url: info.actions_service_url,
            admin_token: info.admin_token,
            expires_at,
        })
    }

    /// Current Actions-service URL and admin token, refreshed when needed.
    pub(crate) async fn admin_credentials(&self) -> Result<(String, String), ActionsError> {
        let mut state = self.auth.lock().await;

        let refresh_at = state.expires_at - ChronoDuration::seconds(TOKEN_REFRESH_WINDOW_SECS);
        if Utc::now() >= refresh_at {
            info!(url = %self.github.url, "refreshing admin token");
            *state = Self::authorize(&self.http, &self.settings, &self.github).await?;
        }

        Ok((state.actions_service_url.clone(), state.admin_token.clone()))
    }

    async fn request_json<Req, Res>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Req>,
    ) -> Result<Option<Res>, ActionsError>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let (base, token) = self.admin_credentials().await?;
        let url = service_url(&base, path, query)?;

        let mut builder = self
            .http
            .request(method, url)
            .headers(http::bearer_headers(&token)?);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let request = builder.build().map_err(ActionsError::from)?;
        let response = http::send_with_retry(&self.http, request).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(error_from_response(response).await),
        }
    }

    async fn get<Res: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Res>, ActionsError> {
        self.request_json::<(), Res>(Method::GET, path, query, None)
            .await
    }
}

/// Join a service-relative path onto the Actions service URL, pinning the
/// api version unless the path already carries one.
pub(crate) fn service_url(
    base: &str,
    path: &str,
    query: &[(&str, String)],
) -> Result<Url, ActionsError> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url =
        Url::parse(&joined).map_err(|e| ActionsError::Url(format!("{joined}: {e}")))?;

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    let has_version = url.query_pairs().any(|(k, _)| k == "api-version");
    if !has_version {
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
    }

    Ok(url)
}

#[async_trait]
impl ActionsApi for ActionsClient {
    async fn get_runner_scale_set(
        &self,
        runner_group_id: i64,
        name: &str,
    ) -> Result<Option<RunnerScaleSet>, ActionsError> {
        let list: ScaleSetList = self
            .get(
                SCALE_SET_ENDPOINT,
                &[
                    ("runnerGroupId", runner_group_id.to_string()),
                    ("name", name.to_string()),
                ],
            )
            .await?
            .unwrap_or_default();

        match list.count {
            0 => Ok(None),
            1 => Ok(list.scale_sets.into_iter().next()),
            _ => Err(ActionsError::Unexpected(format!(
                "multiple runner scale sets found with name {name}"
            ))),
        }
    }

    async fn create_runner_scale_set(
        &self,
        scale_set: &RunnerScaleSet,
    ) -> Result<RunnerScaleSet, ActionsError> {
        self.request_json(Method::POST, SCALE_SET_ENDPOINT, &[], Some(scale_set))
            .await?
            .ok_or_else(|| {
                ActionsError::Unexpected("scale set creation returned an empty response".into())
            })
    }

    async fn delete_runner_scale_set(&self, scale_set_id: i64) -> Result<(), ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}");
        bridge_retry::retry(
            &http::retry_policy(),
            8,
            |e: &ActionsError| !e.is_client_side(),
            || {
                let path = path.as_str();
                async move {
                    self.request_json::<(), serde_json::Value>(Method::DELETE, path, &[], None)
                        .await
                        .map(|_| ())
                }
            },
        )
        .await
    }

    async fn create_jit_runner(
        &self,
        scale_set_id: i64,
        runner_name: &str,
    ) -> Result<JitRunnerConfig, ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}/generatejitconfig");
        let setting = JitRunnerSetting {
            name: runner_name.to_string(),
            work_folder: String::new(),
        };

        self.request_json(Method::POST, &path, &[], Some(&setting))
            .await?
            .ok_or_else(|| {
                ActionsError::Unexpected("JIT config generation returned an empty response".into())
            })
    }

    async fn get_runner(
        &self,
        runner_name: &str,
    ) -> Result<Option<RunnerReference>, ActionsError> {
        let list: RunnerReferenceList = self
            .get(RUNNER_ENDPOINT, &[("agentName", runner_name.to_string())])
            .await?
            .unwrap_or_default();

        match list.count {
            0 => Ok(None),
            1 => Ok(list.runners.into_iter().next()),
            _ => Err(ActionsError::Unexpected(format!(
                "multiple runners found with name {runner_name}"
            ))),
        }
    }

    async fn delete_runner(&self, runner_id: i64) -> Result<(), ActionsError> {
        let path = format!("{RUNNER_ENDPOINT}/{runner_id}");
        self.request_json::<(), serde_json::Value>(Method::DELETE, &path, &[], None)
            .await
            .map(|_| ())
    }

    async fn create_message_session(
        &self,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<ScaleSetSession, ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}/sessions");
        let new_session = ScaleSetSession {
            owner_name: owner.to_string(),
            ..Default::default()
        };

        self.request_json(Method::POST, &path, &[], Some(&new_session))
            .await?
            .ok_or_else(|| {
                ActionsError::Unexpected("session creation returned an empty response".into())
            })
    }

    async fn refresh_message_session(
        &self,
        scale_set_id: i64,
        session_id: &Uuid,
    ) -> Result<ScaleSetSession, ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}/sessions/{session_id}");

        self.request_json::<(), ScaleSetSession>(Method::PATCH, &path, &[], None)
            .await?
            .ok_or_else(|| {
                ActionsError::Unexpected("session refresh returned an empty response".into())
            })
    }

    async fn delete_message_session(
        &self,
        scale_set_id: i64,
        session_id: &Uuid,
    ) -> Result<(), ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}/sessions/{session_id}");
        self.request_json::<(), serde_json::Value>(Method::DELETE, &path, &[], None)
            .await
            .map(|_| ())
    }

    async fn get_acquirable_jobs(
        &self,
        scale_set_id: i64,
    ) -> Result<AcquirableJobList, ActionsError> {
        let path = format!("{SCALE_SET_ENDPOINT}/{scale_set_id}/acquirablejobs");
        Ok(self.get(&path, &[]).await?.unwrap_or_default())
    }

    async fn get_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ActionsError> {
        crate::queue::get_message(&self.http, queue_url, queue_token, last_message_id).await
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        message_id: i64,
    ) -> Result<(), ActionsError> {
        crate::queue::delete_message(&self.http, queue_url, queue_token, message_id).await
    }

    async fn acquire_jobs(
        &self,
        scale_set_id: i64,
        queue_token: &str,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ActionsError> {
        let (base, _) = self.admin_credentials().await?;
        crate::queue::acquire_jobs(&self.http, &base, scale_set_id, queue_token, request_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_url_appends_api_version() {
        let url = service_url(
            "https://actions.example.com/tenant/",
            "/_apis/runtime/runnerscalesets",
            &[],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://actions.example.com/tenant/_apis/runtime/runnerscalesets?api-version=6.0-preview"
        );
    }

    #[test]
    fn test_service_url_escapes_query_values() {
        let url = service_url(
            "https://actions.example.com",
            "_apis/distributedtask/pools/0/agents",
            &[("agentName", "vm one".to_string())],
        )
        .unwrap();
        assert!(url.as_str().contains("agentName=vm+one"));
        assert!(url.as_str().contains("api-version=6.0-preview"));
    }

    #[test]
    fn test_service_url_keeps_existing_api_version() {
        let url = service_url(
            "https://actions.example.com",
            "x?api-version=5.0",
            &[],
        )
        .unwrap();
        let versions: Vec<_> = url
            .query_pairs()
            .filter(|(k, _)| k == "api-version")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(versions, vec!["5.0".to_string()]);
    }
}

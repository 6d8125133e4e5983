//! Wire types for the Actions backend.
//!
//! Field names follow the backend's JSON contract exactly; everything the
//! backend may omit carries `#[serde(default)]` so partial payloads decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// A named pool of runners in the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSet {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub runner_group_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner_group_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<ScaleSetLabel>,
    #[serde(rename = "RunnerSetting", default)]
    pub runner_setting: ScaleSetSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner_jit_config_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ScaleSetStatistics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSetLabel {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetSetting {
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub is_elastic: bool,
    #[serde(default)]
    pub disable_update: bool,
}

/// Statistics snapshot attached to sessions and every queue message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetStatistics {
    #[serde(default)]
    pub total_available_jobs: i64,
    #[serde(default)]
    pub total_acquired_jobs: i64,
    #[serde(default)]
    pub total_assigned_jobs: i64,
    #[serde(default)]
    pub total_running_jobs: i64,
    #[serde(default)]
    pub total_registered_runners: i64,
    #[serde(default)]
    pub total_busy_runners: i64,
    #[serde(default)]
    pub total_idle_runners: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScaleSetList {
    #[serde(default)]
    pub count: i64,
    #[serde(default, rename = "value")]
    pub scale_sets: Vec<RunnerScaleSet>,
}

/// An authenticated tether to a scale set's message queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_scale_set: Option<RunnerScaleSet>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_queue_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_queue_access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ScaleSetStatistics>,
}

/// One long-poll message from the queue.
///
/// `message_id == 0` with an empty body is reserved for the synthesized
/// statistics-only startup message and never reaches the delete endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetMessage {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub statistics: Option<ScaleSetStatistics>,
}

/// Tag-only peek used to dispatch job sub-messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessageKind {
    #[serde(default)]
    pub message_type: String,
}

/// Fields shared by all job sub-messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessageBase {
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub runner_request_id: i64,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub job_workflow_ref: String,
    #[serde(default)]
    pub job_display_name: String,
    #[serde(default)]
    pub workflow_run_id: i64,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub request_labels: Vec<String>,
    #[serde(default)]
    pub queue_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scale_set_assign_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runner_assign_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAvailable {
    #[serde(default)]
    pub acquire_job_url: String,
    #[serde(flatten)]
    pub base: JobMessageBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobAssigned {
    #[serde(flatten)]
    pub base: JobMessageBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    #[serde(default)]
    pub runner_id: i64,
    #[serde(default)]
    pub runner_name: String,
    #[serde(flatten)]
    pub base: JobMessageBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompleted {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub runner_id: i64,
    #[serde(default)]
    pub runner_name: String,
    #[serde(flatten)]
    pub base: JobMessageBase,
}

/// A job the backend is offering to this pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquirableJob {
    #[serde(default)]
    pub acquire_job_url: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub runner_request_id: i64,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub job_workflow_ref: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub request_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquirableJobList {
    #[serde(default)]
    pub count: i64,
    #[serde(default, rename = "value")]
    pub jobs: Vec<AcquirableJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Int64List {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub value: Vec<i64>,
}

/// Request payload for `generatejitconfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JitRunnerSetting {
    pub name: String,
    #[serde(default)]
    pub work_folder: String,
}

/// A freshly minted just-in-time runner and its encoded agent config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JitRunnerConfig {
    #[serde(default)]
    pub runner: Option<RunnerReference>,
    #[serde(default, rename = "encodedJITConfig")]
    pub encoded_jit_config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReference {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runner_scale_set_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerReferenceList {
    #[serde(default)]
    pub count: i64,
    #[serde(default, rename = "value")]
    pub runners: Vec<RunnerReference>,
}

/// Installation access token from the public API.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Short-lived runner registration token.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationPayload {
    pub url: String,
    pub runner_event: String,
}

/// Admin credentials for the Actions service, exchanged from a registration
/// token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationInfo {
    #[serde(rename = "token")]
    pub admin_token: String,
    #[serde(rename = "url")]
    pub actions_service_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_set_create_payload_shape() {
        let scale_set = RunnerScaleSet {
            name: "macos-pool".to_string(),
            runner_group_id: 1,
            labels: vec![ScaleSetLabel {
                kind: "System".to_string(),
                name: "macos-pool".to_string(),
            }],
            runner_setting: ScaleSetSetting {
                ephemeral: true,
                disable_update: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&scale_set).unwrap();
        assert!(json.contains("\"name\":\"macos-pool\""));
        assert!(json.contains("\"runnerGroupId\":1"));
        assert!(json.contains("\"RunnerSetting\""));
        assert!(json.contains("\"ephemeral\":true"));
        // A zero id must be omitted so the backend assigns one.
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_session_deserialization() {
        let json = r#"{
            "sessionId": "1f0d6a5f-51c8-47a3-b34c-f78e0e1a3b2e",
            "ownerName": "runner-host-1",
            "runnerScaleSet": {"id": 7, "name": "macos-pool"},
            "messageQueueUrl": "https://pipelines.example.com/_apis/queue/1",
            "messageQueueAccessToken": "tok",
            "statistics": {"totalAvailableJobs": 2, "totalAssignedJobs": 1}
        }"#;

        let session: ScaleSetSession = serde_json::from_str(json).unwrap();
        assert!(session.session_id.is_some());
        assert_eq!(session.runner_scale_set.as_ref().unwrap().id, 7);
        assert_eq!(session.statistics.unwrap().total_available_jobs, 2);
        assert_eq!(session.statistics.unwrap().total_acquired_jobs, 0);
    }

    #[test]
    fn test_job_sub_message_decoding() {
        let json = r#"{
            "messageType": "JobCompleted",
            "jobId": "a1b2",
            "runnerRequestId": 42,
            "runnerId": 7,
            "runnerName": "vm-x",
            "result": "succeeded"
        }"#;

        let kind: JobMessageKind = serde_json::from_str(json).unwrap();
        assert_eq!(kind.message_type, "JobCompleted");

        let completed: JobCompleted = serde_json::from_str(json).unwrap();
        assert_eq!(completed.base.job_id, "a1b2");
        assert_eq!(completed.base.runner_request_id, 42);
        assert_eq!(completed.runner_id, 7);
        assert_eq!(completed.result, "succeeded");
    }

    #[test]
    fn test_jit_config_field_names() {
        let json = r#"{
            "runner": {"id": 9, "name": "vm-a", "runnerScaleSetId": 3},
            "encodedJITConfig": "ZXhhbXBsZQ=="
        }"#;

        let config: JitRunnerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.runner.unwrap().id, 9);
        assert_eq!(config.encoded_jit_config, "ZXhhbXBsZQ==");

        let setting = JitRunnerSetting {
            name: "vm-a".to_string(),
            work_folder: String::new(),
        };
        let json = serde_json::to_string(&setting).unwrap();
        assert!(json.contains("\"workFolder\":\"\""));
    }

    #[test]
    fn test_acquirable_jobs_list_uses_value_key() {
        let json = r#"{"count": 1, "value": [{"runnerRequestId": 10, "messageType": "JobAvailable"}]}"#;
        let list: AcquirableJobList = serde_json::from_str(json).unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.jobs[0].runner_request_id, 10);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /projects/{project_id}/runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub query_text: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

impl CreateRunRequest {
    pub fn new(query_text: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            mode: mode.into(),
            parent_run_id: None,
            purpose: None,
        }
    }
}

/// Response of run creation. `kind` tells whether the server planned work
/// (`act`), answered directly (`chat`) or needs clarification (`clarify`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIntentResponse {
    pub kind: String,
    pub run: Value,
    #[serde(default)]
    pub intent: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
}

impl RunIntentResponse {
    pub fn run_id(&self) -> Option<&str> {
        self.run.get("id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

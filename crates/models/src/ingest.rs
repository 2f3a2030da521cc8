use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::analytics_event::BatchedEvent;

/// Body of the `ingest_analytics_batch` RPC
#[derive(Debug, Serialize)]
pub struct IngestRequest<'a> {
    pub events: &'a [BatchedEvent],
}

/// Result returned by the ingest RPC.
///
/// Every field is optional: the backend may answer with an empty body, `null`,
/// or an object that only reports `success`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
pub struct IngestResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processed: Option<u64>,
}

impl IngestResponse {
    /// Parse a response body, treating empty bodies and non-object JSON as success
    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(Self::default());
        }

        match serde_json::from_str::<serde_json::Value>(body)? {
            value @ serde_json::Value::Object(_) => serde_json::from_value(value),
            _ => Ok(Self::default()),
        }
    }

    /// The backend explicitly reported a processing failure
    pub fn is_rejected(&self) -> bool {
        self.success == Some(false)
    }

    pub fn failure_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "ingest reported success=false".to_string())
    }
}

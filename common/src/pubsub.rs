use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::job::{JobId, JobKind};

pub const ATTR_OPERATION: &str = "operation";
pub const ATTR_TIMESTAMP: &str = "timestamp";
pub const ATTR_JOB_ID: &str = "job_id";
pub const ATTR_KIND: &str = "kind";

/// Body of a pub/sub push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
    #[serde(default, rename = "deliveryAttempt", skip_serializing_if = "Option::is_none")]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Base64 payload, opaque to us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: String,
}

impl PushEnvelope {
    /// Envelope the status task queue delivers to `/task/status/{queue}`,
    /// shaped like the provider's own completion events.
    pub fn for_status_check(job_id: &str, kind: JobKind, operation: &str, timestamp: &str) -> Self {
        let attributes = HashMap::from([
            (ATTR_OPERATION.to_string(), operation.to_string()),
            (ATTR_TIMESTAMP.to_string(), timestamp.to_string()),
            (ATTR_JOB_ID.to_string(), job_id.to_string()),
            (ATTR_KIND.to_string(), kind.to_string()),
        ]);
        Self {
            message: PushMessage {
                attributes,
                data: None,
                message_id: format!("status-{}", job_id),
            },
            subscription: String::new(),
            delivery_attempt: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.message
            .attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Operation name carried by the event, if any.
    pub fn operation(&self) -> Option<&str> {
        self.attribute(ATTR_OPERATION)
    }

    /// Job id hint; only present on events we enqueued ourselves.
    pub fn job_id(&self) -> Option<JobId> {
        self.attribute(ATTR_JOB_ID).map(str::to_string)
    }
}

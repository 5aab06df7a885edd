//! Trait seams for every remote collaborator of the scheduler.
//!
//! - `RepoMetadataSource`: repository metadata (`repomd.xml`) downloads
//! - `DashboardGateway`: QEM dashboard incidents and already-scheduled jobs
//! - `CloudImageSource`: public-cloud image catalogs (tools image, pint)
//!
//! All traits are async and transport-agnostic. HTTP implementations live in
//! the `qem-http` crate; in-memory fakes for testing live in [`crate::fakes`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::incident::RawIncident;
use crate::error::FetchError;

// ---------------------------------------------------------------------------
// RepoMetadataSource
// ---------------------------------------------------------------------------

/// Outcome of a metadata download that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoReply {
    /// Successful response body.
    Found(Vec<u8>),
    /// Non-success status; the repository is skipped.
    Missing { status: u16 },
}

#[async_trait]
pub trait RepoMetadataSource: Send + Sync {
    /// Download `url`. Transport failures (after any retries) are errors;
    /// a non-success HTTP status is a [`RepoReply::Missing`].
    async fn fetch(&self, url: &str) -> Result<RepoReply, FetchError>;
}

// ---------------------------------------------------------------------------
// DashboardGateway
// ---------------------------------------------------------------------------

/// A job the dashboard already knows about for an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub flavor: String,
    pub arch: String,
    /// `settings.REPOHASH`, normalised to a string.
    pub repohash: Option<String>,
}

impl ScheduledJob {
    /// Read one entry of an `api/incident_settings/{id}` answer. Entries
    /// without flavor or arch are ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        let flavor = value.get("flavor")?.as_str()?.to_string();
        let arch = value.get("arch")?.as_str()?.to_string();
        let repohash = value
            .get("settings")
            .and_then(|s| s.get("REPOHASH"))
            .and_then(|r| match r {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        Some(Self {
            flavor,
            arch,
            repohash,
        })
    }

    /// Parse a whole answer. An object carrying an `error` key, or anything
    /// that is not an array, means "no jobs".
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        match value {
            Value::Array(items) => items.iter().filter_map(Self::from_value).collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
pub trait DashboardGateway: Send + Sync {
    /// Jobs already recorded for `incident_id`.
    async fn scheduled_jobs(&self, incident_id: u64) -> Result<Vec<ScheduledJob>, FetchError>;

    /// Active incidents known to the dashboard.
    async fn incidents(&self) -> Result<Vec<RawIncident>, FetchError>;
}

// ---------------------------------------------------------------------------
// CloudImageSource
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CloudImageSource: Send + Sync {
    /// GET `url` and decode the JSON body.
    async fn get_json(&self, url: &str) -> Result<Value, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scheduled_job_repohash_forms() {
        let jobs = ScheduledJob::list_from_value(&json!([
            {"flavor": "Server-DVD-Incidents", "arch": "x86_64", "settings": {"REPOHASH": 17}},
            {"flavor": "Server-DVD-Incidents", "arch": "aarch64", "settings": {"REPOHASH": "17"}},
            {"flavor": "Minimal", "arch": "s390x", "settings": {}},
            {"flavor": null},
        ]));
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].repohash.as_deref(), Some("17"));
        assert_eq!(jobs[1].repohash.as_deref(), Some("17"));
        assert_eq!(jobs[2].repohash, None);
    }

    #[test]
    fn test_error_object_means_no_jobs() {
        let jobs = ScheduledJob::list_from_value(&json!({"error": "not found"}));
        assert!(jobs.is_empty());
    }
}

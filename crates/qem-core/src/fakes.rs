//! In-memory fakes for the gateway traits (testing only)
//!
//! Provides `MemoryRepoMetadata`, `MemoryDashboard`, and `MemoryCloudImages`
//! that answer from maps and count the calls they receive.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::incident::RawIncident;
use crate::error::FetchError;
use crate::gateway::*;

/// Minimal `repomd.xml` carrying `revision`.
pub fn repomd_xml(revision: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
  <revision>{}</revision>
</repomd>
"#,
        revision
    )
}

fn bump(calls: &Mutex<HashMap<String, usize>>, key: &str) {
    *calls.lock().unwrap().entry(key.to_string()).or_default() += 1;
}

// ---------------------------------------------------------------------------
// MemoryRepoMetadata
// ---------------------------------------------------------------------------

/// Repository metadata keyed by URL. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MemoryRepoMetadata {
    replies: Mutex<HashMap<String, Result<RepoReply, FetchError>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryRepoMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_revision(&self, url: &str, revision: u64) {
        self.insert_body(url, repomd_xml(revision).into_bytes());
    }

    pub fn insert_body(&self, url: &str, body: Vec<u8>) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(RepoReply::Found(body)));
    }

    pub fn insert_missing(&self, url: &str, status: u16) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(RepoReply::Missing { status }));
    }

    /// Make `url` fail with a transport error.
    pub fn insert_failure(&self, url: &str) {
        self.replies.lock().unwrap().insert(
            url.to_string(),
            Err(FetchError::Transport("connection refused".to_string())),
        );
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RepoMetadataSource for MemoryRepoMetadata {
    async fn fetch(&self, url: &str) -> Result<RepoReply, FetchError> {
        bump(&self.calls, url);
        self.replies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Ok(RepoReply::Missing { status: 404 }))
    }
}

// ---------------------------------------------------------------------------
// MemoryDashboard
// ---------------------------------------------------------------------------

/// Dashboard with preset scheduled jobs and incidents.
#[derive(Debug, Default)]
pub struct MemoryDashboard {
    jobs: Mutex<HashMap<u64, Vec<ScheduledJob>>>,
    failing: Mutex<HashSet<u64>>,
    incidents: Mutex<Vec<RawIncident>>,
    queries: Mutex<HashMap<String, usize>>,
}

impl MemoryDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, incident: u64, flavor: &str, arch: &str, repohash: Option<&str>) {
        self.jobs
            .lock()
            .unwrap()
            .entry(incident)
            .or_default()
            .push(ScheduledJob {
                flavor: flavor.to_string(),
                arch: arch.to_string(),
                repohash: repohash.map(str::to_string),
            });
    }

    /// Queries for `incident` fail with a server error.
    pub fn fail_for(&self, incident: u64) {
        self.failing.lock().unwrap().insert(incident);
    }

    pub fn set_incidents(&self, incidents: Vec<RawIncident>) {
        *self.incidents.lock().unwrap() = incidents;
    }

    /// Number of `scheduled_jobs` queries for `incident`.
    pub fn queries(&self, incident: u64) -> usize {
        self.queries
            .lock()
            .unwrap()
            .get(&incident.to_string())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DashboardGateway for MemoryDashboard {
    async fn scheduled_jobs(&self, incident_id: u64) -> Result<Vec<ScheduledJob>, FetchError> {
        bump(&self.queries, &incident_id.to_string());
        if self.failing.lock().unwrap().contains(&incident_id) {
            return Err(FetchError::Status {
                status: 503,
                url: format!("api/incident_settings/{}", incident_id),
            });
        }
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&incident_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn incidents(&self) -> Result<Vec<RawIncident>, FetchError> {
        Ok(self.incidents.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryCloudImages
// ---------------------------------------------------------------------------

/// Image catalog answers keyed by URL. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MemoryCloudImages {
    answers: Mutex<HashMap<String, Value>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryCloudImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: Value) {
        self.answers.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CloudImageSource for MemoryCloudImages {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        bump(&self.calls, url);
        self.answers
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                url: url.to_string(),
            })
    }
}

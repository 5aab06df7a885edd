//! Job scheduling requests produced by the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dashboard endpoint the requests are meant for.
pub const INCIDENT_SETTINGS_API: &str = "api/incident_settings";

/// Bookkeeping half of a request, stored by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemSection {
    pub incident: u64,
    pub arch: String,
    pub flavor: String,
    pub version: String,
    #[serde(rename = "withAggregate")]
    pub with_aggregate: bool,
    pub settings: BTreeMap<String, String>,
}

/// A finished scheduling request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub api: String,
    pub qem: QemSection,
    /// Test-runner settings; identical to `qem.settings`.
    pub openqa: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn incident(&self) -> u64 {
        self.qem.incident
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.openqa.get(key).map(String::as_str)
    }
}

/// Accumulates one candidate request. Only [`JobBuilder::finish`] makes it
/// visible; dropping the builder discards it.
#[derive(Debug, Clone)]
pub(crate) struct JobBuilder {
    incident: u64,
    arch: String,
    flavor: String,
    version: String,
    with_aggregate: bool,
    settings: BTreeMap<String, String>,
}

impl JobBuilder {
    pub(crate) fn new(incident: u64, flavor: &str, arch: &str, version: &str) -> Self {
        Self {
            incident,
            arch: arch.to_string(),
            flavor: flavor.to_string(),
            version: version.to_string(),
            with_aggregate: true,
            settings: BTreeMap::new(),
        }
    }

    pub(crate) fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.settings.insert(key.into(), value.to_string());
        self
    }

    pub(crate) fn extend<'a, I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in entries {
            self.settings.insert(key.clone(), value.clone());
        }
        self
    }

    pub(crate) fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    pub(crate) fn settings_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.settings
    }

    pub(crate) fn with_aggregate(&mut self, needed: bool) -> &mut Self {
        self.with_aggregate = needed;
        self
    }

    pub(crate) fn finish(self) -> JobRequest {
        JobRequest {
            api: INCIDENT_SETTINGS_API.to_string(),
            qem: QemSection {
                incident: self.incident,
                arch: self.arch,
                flavor: self.flavor,
                version: self.version,
                with_aggregate: self.with_aggregate,
                settings: self.settings.clone(),
            },
            openqa: self.settings,
        }
    }
}

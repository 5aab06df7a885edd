//! Incident-to-job decision engine.
//!
//! For every template, flavor, architecture and incident (in that order) the
//! engine runs a fixed chain of filters. Surviving triples become a
//! [`JobRequest`] carrying the full openQA settings. Triples are evaluated by
//! a bounded pool of futures; results keep submission order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::cloud::CloudImageResolver;
use crate::config::{self, BotConfig};
use crate::domain::channel::RepoChannel;
use crate::domain::incident::Incident;
use crate::domain::job::{JobBuilder, JobRequest};
use crate::domain::template::{FlavorRule, JobTemplate};
use crate::error::CloudImageError;
use crate::gateway::{CloudImageSource, DashboardGateway};
use crate::obs;

/// openQA's default job priority.
pub const BASE_PRIORITY: i64 = 50;

/// Issue keys naming a kernel product repository.
pub const KERNEL_ISSUE_KEYS: [&str; 4] = [
    "OS_TEST_ISSUES",
    "LTSS_TEST_ISSUES",
    "BASE_TEST_ISSUES",
    "RT_TEST_ISSUES",
];

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Skip embargoed incidents for every template.
    pub filter_embargoed: bool,
    /// Schedule even if the dashboard already has the job.
    pub ignore_onetime: bool,
    pub ci_url: Option<String>,
    /// Packages without aggregate coverage.
    pub singlearch: HashSet<String>,
    /// Triples evaluated concurrently.
    pub workers: usize,
    pub download_base: String,
    pub dashboard_base: String,
    pub smelt_base: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            filter_embargoed: false,
            ignore_onetime: false,
            ci_url: None,
            singlearch: HashSet::new(),
            workers: 8,
            download_base: config::DEFAULT_INCIDENT_DOWNLOAD_BASE.to_string(),
            dashboard_base: config::DEFAULT_DASHBOARD_URL.to_string(),
            smelt_base: config::DEFAULT_SMELT_URL.to_string(),
        }
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            ci_url: config.ci_job_url.clone(),
            download_base: config.incident_download_base.clone(),
            dashboard_base: config.dashboard_url.clone(),
            smelt_base: config.smelt_url.clone(),
            ..Self::default()
        }
    }
}

/// Why a (flavor, arch, incident) triple produced no request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Embargoed,
    Staging,
    PackageNotAllowed,
    PackageExcluded,
    NoRevision,
    NoMatchingChannel,
    RequiredIssueMissing,
    AlreadyScheduled,
    KernelWithoutProductRepo,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Embargoed => "embargoed",
            SkipReason::Staging => "staging",
            SkipReason::PackageNotAllowed => "package_not_allowed",
            SkipReason::PackageExcluded => "package_excluded",
            SkipReason::NoRevision => "no_revision",
            SkipReason::NoMatchingChannel => "no_matching_channel",
            SkipReason::RequiredIssueMissing => "required_issue_missing",
            SkipReason::AlreadyScheduled => "already_scheduled",
            SkipReason::KernelWithoutProductRepo => "kernel_without_product_repo",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one triple.
#[derive(Debug)]
pub enum Decision {
    Schedule(JobRequest),
    Skip(SkipReason),
    /// Passed the filters but the cloud image could not be resolved.
    Drop(CloudImageError),
}

pub struct SchedulingEngine {
    dashboard: Arc<dyn DashboardGateway>,
    images: Arc<dyn CloudImageSource>,
    options: SchedulerOptions,
}

impl SchedulingEngine {
    pub fn new(
        dashboard: Arc<dyn DashboardGateway>,
        images: Arc<dyn CloudImageSource>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            dashboard,
            images,
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Evaluate every triple and return the requests to post, in
    /// (template, flavor, arch, incident) order.
    pub async fn run(&self, templates: &[JobTemplate], incidents: &[Incident]) -> Vec<JobRequest> {
        let run_id = Uuid::new_v4().to_string();
        self.run_inner(templates, incidents)
            .instrument(obs::run_span(&run_id))
            .await
    }

    async fn run_inner(&self, templates: &[JobTemplate], incidents: &[Incident]) -> Vec<JobRequest> {
        let started = Instant::now();
        obs::emit_run_started(templates.len(), incidents.len());

        // One image cache per run.
        let images = CloudImageResolver::new(self.images.clone());
        let images = &images;

        let triples = templates.iter().flat_map(|template| {
            template.flavors.iter().flat_map(move |rule| {
                rule.archs.iter().flat_map(move |arch| {
                    incidents
                        .iter()
                        .map(move |incident| (template, rule, arch.as_str(), incident))
                })
            })
        });

        let requests: Vec<JobRequest> = stream::iter(triples)
            .map(|(template, rule, arch, incident)| async move {
                match self.decide(template, rule, arch, incident, images).await {
                    Decision::Schedule(request) => {
                        obs::emit_job_scheduled(
                            incident.id(),
                            &rule.name,
                            arch,
                            request.setting("REPOHASH").unwrap_or_default(),
                        );
                        Some(request)
                    }
                    Decision::Skip(reason) => {
                        obs::emit_job_skipped(incident.id(), &rule.name, arch, reason.as_str());
                        None
                    }
                    Decision::Drop(err) => {
                        obs::emit_image_unresolved(incident.id(), &rule.name, &err);
                        None
                    }
                }
            })
            .buffered(self.options.workers.max(1))
            .filter_map(|request| async move { request })
            .collect()
            .await;

        obs::emit_run_finished(requests.len(), started.elapsed().as_millis() as u64);
        requests
    }

    /// Run the filter chain for one triple and build its request.
    pub async fn decide(
        &self,
        template: &JobTemplate,
        rule: &FlavorRule,
        arch: &str,
        incident: &Incident,
        images: &CloudImageResolver,
    ) -> Decision {
        let flavor = rule.name.as_str();
        let version = template.version();

        if (self.options.filter_embargoed || template.filter_embargoed) && incident.embargoed() {
            return Decision::Skip(SkipReason::Embargoed);
        }
        if incident.staging() {
            return Decision::Skip(SkipReason::Staging);
        }
        if let Some(packages) = &rule.packages {
            if !incident.contains_package(packages) {
                return Decision::Skip(SkipReason::PackageNotAllowed);
            }
        }
        if let Some(excluded) = &rule.excluded_packages {
            if incident.contains_package(excluded) {
                return Decision::Skip(SkipReason::PackageExcluded);
            }
        }
        let Some(revision) = incident.revision_with_fallback(arch, version) else {
            return Decision::Skip(SkipReason::NoRevision);
        };

        let mut matched_keys: Vec<&str> = Vec::new();
        let mut matched_channels: BTreeSet<RepoChannel> = BTreeSet::new();
        for (key, prodver) in &rule.issues {
            let channel = prodver.channel(arch);
            if incident.channels().contains(&channel) {
                matched_keys.push(key);
                matched_channels.insert(channel);
            }
        }
        if matched_keys.is_empty() {
            return Decision::Skip(SkipReason::NoMatchingChannel);
        }
        if let Some(required) = &rule.required_issues {
            if !matched_keys.iter().any(|k| required.contains(*k)) {
                return Decision::Skip(SkipReason::RequiredIssueMissing);
            }
        }
        if !self.options.ignore_onetime && self.is_scheduled(incident.id(), flavor, arch, revision).await {
            return Decision::Skip(SkipReason::AlreadyScheduled);
        }
        if flavor.contains("Kernel")
            && !incident.livepatch()
            && !flavor.ends_with("Azure")
            && !matched_keys.iter().any(|k| KERNEL_ISSUE_KEYS.contains(k))
        {
            warn!(
                incident = incident.id(),
                flavor = %flavor,
                "Kernel incident doesn't have product repository"
            );
            return Decision::Skip(SkipReason::KernelWithoutProductRepo);
        }

        let id = incident.id();
        let mut job = JobBuilder::new(id, flavor, arch, version);
        job.extend(&template.settings)
            .set("ARCH", arch)
            .set("FLAVOR", flavor)
            .set("VERSION", version)
            .set("DISTRI", template.distri())
            .set("_ONLY_OBSOLETE_SAME_BUILD", "1")
            .set("_OBSOLETE", "1")
            .set("INCIDENT_ID", id);
        if let Some(ci_url) = &self.options.ci_url {
            job.set("__CI_JOB_URL", ci_url);
        }
        if incident.livepatch() {
            job.set("KGRAFT", "1");
        }
        let first_package = incident.packages().first().map(String::as_str).unwrap_or_default();
        job.set("BUILD", format!(":{}:{}", id, first_package));
        if let Some(rrid) = incident.rrid() {
            job.set("RRID", rrid);
        }
        job.set("REPOHASH", revision);
        for key in &matched_keys {
            job.set(*key, id);
        }
        job.set(
            "INCIDENT_REPO",
            incident_repos(&self.options.download_base, id, &matched_channels),
        );

        let with_aggregate = aggregate_needed(rule, job.settings(), incident.packages(), &self.options.singlearch);
        job.with_aggregate(with_aggregate);

        let delta = priority_delta(rule.override_priority, flavor, incident.staging(), incident.emu());
        if delta != 0 {
            job.set("_PRIORITY", BASE_PRIORITY + delta);
        }

        job.extend(&rule.params_expand)
            .set("__SMELT_INCIDENT_URL", format!("{}incident/{}", self.options.smelt_base, id))
            .set(
                "__DASHBOARD_INCIDENT_URL",
                format!("{}incident/{}", self.options.dashboard_base, id),
            );

        if let Err(err) = images.enrich(job.settings_mut()).await {
            return Decision::Drop(err);
        }

        Decision::Schedule(job.finish())
    }

    /// Whether the dashboard already has this job at `revision`. Query
    /// failures count as "not scheduled".
    async fn is_scheduled(&self, incident: u64, flavor: &str, arch: &str, revision: u64) -> bool {
        let jobs = match self.dashboard.scheduled_jobs(incident).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(incident, error = %err, "Dashboard query failed, assuming no scheduled jobs");
                return false;
            }
        };
        let revision = revision.to_string();
        jobs.iter().any(|job| {
            job.flavor == flavor && job.arch == arch && job.repohash.as_deref() == Some(revision.as_str())
        })
    }
}

/// Sorted, comma-joined download URLs of the matched channels.
pub fn incident_repos(download_base: &str, incident: u64, channels: &BTreeSet<RepoChannel>) -> String {
    let urls: BTreeSet<String> = channels
        .iter()
        .map(|chan| format!("{}{}/{}", download_base, incident, chan.updates_dir(&chan.arch)))
        .collect();
    urls.into_iter().collect::<Vec<_>>().join(",")
}

/// Whether an aggregate companion job should cover this incident.
///
/// With `aggregate_job: false`, each of these demotes independently:
/// a positive key present in `settings`, no negative key present in
/// `settings`, or either key set left unconfigured.
pub fn aggregate_needed(
    rule: &FlavorRule,
    settings: &BTreeMap<String, String>,
    packages: &[String],
    singlearch: &HashSet<String>,
) -> bool {
    let mut needed = true;
    if !rule.aggregate_job {
        let pos = &rule.aggregate_check_true;
        let neg = &rule.aggregate_check_false;
        if !pos.is_empty() && pos.iter().any(|k| settings.contains_key(k)) {
            needed = false;
        }
        if !neg.is_empty() && !neg.iter().any(|k| settings.contains_key(k)) {
            needed = false;
        }
        if pos.is_empty() || neg.is_empty() {
            needed = false;
        }
    }
    if packages.iter().any(|p| singlearch.contains(p)) {
        needed = false;
    }
    needed
}

/// Offset from [`BASE_PRIORITY`]; zero leaves openQA's default.
pub fn priority_delta(override_priority: Option<i64>, flavor: &str, staging: bool, emu: bool) -> i64 {
    if let Some(priority) = override_priority.filter(|p| *p != 0) {
        return priority - BASE_PRIORITY;
    }
    let mut delta = 0;
    if flavor.ends_with("Minimal") {
        delta -= 5;
    }
    if !staging {
        delta += 10;
    }
    if emu {
        delta = -20;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(aggregate_job: bool, pos: &[&str], neg: &[&str]) -> FlavorRule {
        let mut rule = FlavorRule::new("Server-DVD-Incidents", &["x86_64"], &[("OS_TEST_ISSUES", "SLES:15-SP4")]);
        rule.aggregate_job = aggregate_job;
        rule.aggregate_check_true = pos.iter().map(|s| s.to_string()).collect();
        rule.aggregate_check_false = neg.iter().map(|s| s.to_string()).collect();
        rule
    }

    fn keys(keys: &[&str]) -> BTreeMap<String, String> {
        keys.iter().map(|k| (k.to_string(), "1".to_string())).collect()
    }

    #[test]
    fn test_priority_delta() {
        assert_eq!(priority_delta(Some(5), "Server", false, false), -45);
        assert_eq!(priority_delta(Some(0), "Server", false, true), -20);
        assert_eq!(priority_delta(None, "Server-Minimal", false, false), 5);
        assert_eq!(priority_delta(None, "Server-Minimal", true, false), -5);
        assert_eq!(priority_delta(None, "Server", true, false), 0);
        assert_eq!(priority_delta(None, "Server-Minimal", false, true), -20);
    }

    #[test]
    fn test_aggregate_default_is_needed() {
        let none = HashSet::new();
        assert!(aggregate_needed(&rule(true, &[], &[]), &keys(&[]), &[], &none));
    }

    #[test]
    fn test_aggregate_demotions() {
        let none = HashSet::new();
        // neither set configured
        assert!(!aggregate_needed(&rule(false, &[], &[]), &keys(&["A"]), &[], &none));
        // only positive configured
        assert!(!aggregate_needed(&rule(false, &["X"], &[]), &keys(&["A"]), &[], &none));
        // both configured, positive hit
        assert!(!aggregate_needed(&rule(false, &["A"], &["B"]), &keys(&["A", "B"]), &[], &none));
        // both configured, negative absent
        assert!(!aggregate_needed(&rule(false, &["X"], &["B"]), &keys(&["A"]), &[], &none));
        // both configured, positive absent and negative present
        assert!(aggregate_needed(&rule(false, &["X"], &["B"]), &keys(&["A", "B"]), &[], &none));
    }

    #[test]
    fn test_singlearch_package_demotes() {
        let singlearch: HashSet<String> = ["kernel-64kb".to_string()].into_iter().collect();
        let packages = vec!["kernel-64kb".to_string()];
        assert!(!aggregate_needed(&rule(true, &[], &[]), &keys(&[]), &packages, &singlearch));
    }

    #[test]
    fn test_incident_repos_sorted() {
        let channels: BTreeSet<RepoChannel> = [
            RepoChannel::new("SLE-Module-Basesystem", "15-SP4", "x86_64"),
            RepoChannel::new("openSUSE-SLE", "15.4", "x86_64"),
            RepoChannel::new("SLE-Module-Base", "15-SP4", "x86_64"),
        ]
        .into_iter()
        .collect();
        let repos = incident_repos("http://dl/M:/", 9, &channels);
        assert_eq!(
            repos,
            "http://dl/M:/9/SUSE_Updates_SLE-Module-Base_15-SP4_x86_64,\
             http://dl/M:/9/SUSE_Updates_SLE-Module-Basesystem_15-SP4_x86_64,\
             http://dl/M:/9/SUSE_Updates_openSUSE-SLE_15.4"
        );
    }
}

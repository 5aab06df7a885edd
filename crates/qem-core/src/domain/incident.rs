//! Maintenance incidents as the scheduler sees them.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::channel::{parse_channels, truncate_version, ArchVer, RepoChannel};
use crate::error::IncidentError;
use crate::obs;
use crate::repohash::RevisionResolver;

const LIVEPATCH_BLOCKERS: [&str; 3] = ["kernel-default", "kernel-source", "kernel-azure"];
const LIVEPATCH_MARKERS: [&str; 2] = ["kgraft-patch-", "kernel-livepatch"];
const LIVEPATCH_TOOLS: &str = "kernel-livepatch-tools";

/// Incident record as published by the dashboard (`api/incidents`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIncident {
    pub number: u64,
    pub project: String,
    #[serde(default)]
    pub rr_number: Option<u64>,
    #[serde(rename = "inReview", default)]
    pub in_review: bool,
    #[serde(default)]
    pub embargoed: bool,
    #[serde(default)]
    pub emu: bool,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// A validated incident with resolved repository revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    id: u64,
    project: String,
    rr_number: Option<u64>,
    staging: bool,
    embargoed: bool,
    emu: bool,
    channels: BTreeSet<RepoChannel>,
    packages: Vec<String>,
    livepatch: bool,
    revisions: BTreeMap<ArchVer, u64>,
}

impl Incident {
    /// Validate `raw` and resolve its revisions.
    pub async fn build(raw: RawIncident, resolver: &RevisionResolver) -> Result<Self, IncidentError> {
        debug!(
            incident = raw.number,
            channels = raw.channels.len(),
            "Building incident"
        );

        let channels = parse_channels(&raw.channels);
        if channels.is_empty() {
            return Err(IncidentError::EmptyChannels {
                project: raw.project,
            });
        }

        let mut packages = raw.packages;
        if packages.is_empty() {
            return Err(IncidentError::EmptyPackages {
                project: raw.project,
            });
        }
        packages.sort_by_key(|p| p.len());

        let revisions = resolver.resolve_groups(&channels, &raw.project).await?;
        let livepatch = is_livepatch(&packages);

        Ok(Self {
            id: raw.number,
            project: raw.project,
            rr_number: raw.rr_number,
            staging: !raw.in_review,
            embargoed: raw.embargoed,
            emu: raw.emu,
            channels,
            packages,
            livepatch,
            revisions,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn rr_number(&self) -> Option<u64> {
        self.rr_number
    }

    /// `{project}:{rr_number}` when a review request exists. A request
    /// number of 0 means none.
    pub fn rrid(&self) -> Option<String> {
        self.rr_number.filter(|rr| *rr != 0).map(|rr| format!("{}:{}", self.project, rr))
    }

    /// Not yet in review.
    pub fn staging(&self) -> bool {
        self.staging
    }

    pub fn embargoed(&self) -> bool {
        self.embargoed
    }

    pub fn emu(&self) -> bool {
        self.emu
    }

    pub fn channels(&self) -> &BTreeSet<RepoChannel> {
        &self.channels
    }

    /// Package names, shortest first.
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn livepatch(&self) -> bool {
        self.livepatch
    }

    pub fn revisions(&self) -> &BTreeMap<ArchVer, u64> {
        &self.revisions
    }

    /// True if any package starts with one of `prefixes`.
    /// `kernel-livepatch-tools` never counts.
    pub fn contains_package<S: AsRef<str>>(&self, prefixes: &[S]) -> bool {
        self.packages
            .iter()
            .filter(|p| p.as_str() != LIVEPATCH_TOOLS)
            .any(|p| prefixes.iter().any(|pre| p.starts_with(pre.as_ref())))
    }

    /// Revision for `(arch, version)`; falls back to the first recorded
    /// entry with the same arch, in version order.
    pub fn revision_with_fallback(&self, arch: &str, version: &str) -> Option<u64> {
        let exact = ArchVer {
            arch: arch.to_string(),
            version: truncate_version(version),
        };
        if let Some(rev) = self.revisions.get(&exact) {
            return Some(*rev);
        }
        self.revisions
            .iter()
            .find(|(archver, _)| archver.arch == arch)
            .map(|(_, rev)| *rev)
    }
}

impl std::fmt::Display for Incident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Livepatch if a `kgraft-patch-*` or `kernel-livepatch*` package is
/// present and no full kernel package is.
pub fn is_livepatch<S: AsRef<str>>(packages: &[S]) -> bool {
    let mut kgraft = false;
    for package in packages {
        let package = package.as_ref();
        if LIVEPATCH_BLOCKERS.iter().any(|b| package.starts_with(b)) {
            return false;
        }
        if LIVEPATCH_MARKERS.iter().any(|m| package.starts_with(m)) {
            kgraft = true;
        }
    }
    kgraft
}

/// Build incidents with at most `workers` in flight. Unusable incidents are
/// logged and dropped; input order is kept for the rest.
pub async fn build_incidents(
    raws: Vec<RawIncident>,
    resolver: &RevisionResolver,
    workers: usize,
) -> Vec<Incident> {
    let results: Vec<(u64, Result<Incident, IncidentError>)> = stream::iter(raws)
        .map(|raw| async move {
            let id = raw.number;
            (id, Incident::build(raw, resolver).await)
        })
        .buffered(workers.max(1))
        .collect()
        .await;

    results
        .into_iter()
        .filter_map(|(id, result)| match result {
            Ok(incident) => Some(incident),
            Err(err) => {
                obs::emit_incident_dropped(id, &err);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::RepoUrl;
    use crate::fakes::MemoryRepoMetadata;
    use std::sync::Arc;

    const BASE: &str = "http://download.example.com/ibs";

    fn raw(number: u64, channels: &[&str], packages: &[&str]) -> RawIncident {
        RawIncident {
            number,
            project: format!("SUSE:Maintenance:{}", number),
            rr_number: Some(7),
            in_review: true,
            embargoed: false,
            emu: false,
            packages: packages.iter().map(|s| s.to_string()).collect(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn resolver_with(entries: &[(u64, RepoChannel, u64)]) -> RevisionResolver {
        let source = Arc::new(MemoryRepoMetadata::new());
        for (number, chan, rev) in entries {
            let project = format!("SUSE:Maintenance:{}", number);
            let url = chan
                .compute_url(&RepoUrl::new(BASE).project(&project))
                .unwrap();
            source.insert_revision(&url, *rev);
        }
        RevisionResolver::new(source, BASE)
    }

    #[test]
    fn test_raw_incident_wire_format() {
        let raw: RawIncident = serde_json::from_value(serde_json::json!({
            "number": 42,
            "project": "SUSE:Maintenance:42",
            "rr_number": null,
            "inReview": true,
            "inReviewQAM": true,
            "embargoed": false,
            "emu": true,
            "packages": ["foo"],
            "channels": ["SUSE:Updates:FOO:1:x86_64"],
        }))
        .unwrap();
        assert_eq!(raw.number, 42);
        assert_eq!(raw.rr_number, None);
        assert!(raw.in_review);
        assert!(raw.emu);
    }

    #[test]
    fn test_livepatch_detection() {
        assert!(!is_livepatch(&["kernel-default", "kgraft-patch-x"]));
        assert!(!is_livepatch(&["kgraft-patch-x", "kernel-source"]));
        assert!(is_livepatch(&["kgraft-patch-x"]));
        assert!(is_livepatch(&["kernel-livepatch-SLE15-SP4_Update_3"]));
        assert!(!is_livepatch(&["openssl"]));
        assert!(!is_livepatch::<&str>(&[]));
    }

    #[tokio::test]
    async fn test_empty_channels_rejected() {
        let resolver = resolver_with(&[]);
        let err = Incident::build(raw(1, &["SUSE:SLE-15:Update"], &["foo"]), &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, IncidentError::EmptyChannels { .. }));
    }

    #[tokio::test]
    async fn test_empty_packages_rejected() {
        let resolver = resolver_with(&[]);
        let err = Incident::build(raw(1, &["SUSE:Updates:FOO:1:x86_64"], &[]), &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, IncidentError::EmptyPackages { .. }));
    }

    #[tokio::test]
    async fn test_manager_server_aarch64_never_kept() {
        let resolver = resolver_with(&[]);
        let incident = Incident::build(
            raw(
                1,
                &[
                    "SUSE:Updates:SLE-Module-SUSE-Manager-Server:15:aarch64",
                    "SUSE:Updates:FOO:1:x86_64",
                ],
                &["foo"],
            ),
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(incident.channels().len(), 1);
        assert!(incident
            .channels()
            .iter()
            .all(|c| c.product != "SLE-Module-SUSE-Manager-Server"));
    }

    #[tokio::test]
    async fn test_build_sorts_packages_and_resolves() {
        let chan = RepoChannel::new("FOO", "1", "x86_64");
        let resolver = resolver_with(&[(5, chan, 99)]);
        let incident = Incident::build(
            raw(5, &["SUSE:Updates:FOO:1:x86_64"], &["libfoo-devel", "foo", "libfoo"]),
            &resolver,
        )
        .await
        .unwrap();

        assert_eq!(incident.packages(), &["foo", "libfoo", "libfoo-devel"]);
        assert_eq!(incident.rrid().as_deref(), Some("SUSE:Maintenance:5:7"));
        assert!(!incident.staging());
        assert_eq!(incident.revision_with_fallback("x86_64", "1"), Some(99));
    }

    #[tokio::test]
    async fn test_zero_rr_number_has_no_rrid() {
        let resolver = resolver_with(&[]);
        let mut record = raw(4, &["SUSE:Updates:FOO:1:x86_64"], &["foo"]);
        record.rr_number = Some(0);
        let incident = Incident::build(record, &resolver).await.unwrap();
        assert_eq!(incident.rr_number(), Some(0));
        assert_eq!(incident.rrid(), None);
    }

    #[tokio::test]
    async fn test_contains_package_ignores_livepatch_tools() {
        let resolver = resolver_with(&[]);
        let incident = Incident::build(
            raw(1, &["SUSE:Updates:FOO:1:x86_64"], &["kernel-livepatch-tools", "bar"]),
            &resolver,
        )
        .await
        .unwrap();
        assert!(!incident.contains_package(&["kernel-livepatch"]));
        assert!(incident.contains_package(&["ba"]));
        assert!(!incident.contains_package::<&str>(&[]));
    }

    #[tokio::test]
    async fn test_revision_fallback_uses_same_arch() {
        let resolver = resolver_with(&[
            (3, RepoChannel::new("SLES", "12-SP5", "x86_64"), 11),
            (3, RepoChannel::new("SLES", "15-SP4", "s390x"), 22),
        ]);
        let incident = Incident::build(
            raw(
                3,
                &["SUSE:Updates:SLES:12-SP5:x86_64", "SUSE:Updates:SLES:15-SP4:s390x"],
                &["foo"],
            ),
            &resolver,
        )
        .await
        .unwrap();

        assert_eq!(incident.revision_with_fallback("x86_64", "12-SP5-LTSS"), Some(11));
        assert_eq!(incident.revision_with_fallback("x86_64", "15-SP4"), Some(11));
        assert_eq!(incident.revision_with_fallback("aarch64", "15-SP4"), None);
    }

    #[tokio::test]
    async fn test_build_incidents_drops_failures_and_keeps_order() {
        let resolver = resolver_with(&[]);
        let raws = vec![
            raw(3, &["SUSE:Updates:FOO:1:x86_64"], &["a"]),
            raw(1, &["nothing"], &["b"]),
            raw(2, &["SUSE:Updates:FOO:1:x86_64"], &["c"]),
        ];
        let built = build_incidents(raws, &resolver, 4).await;
        let ids: Vec<u64> = built.iter().map(Incident::id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_build_incidents_drops_unreachable_repository() {
        let chan = RepoChannel::new("FOO", "1", "x86_64");
        let source = Arc::new(MemoryRepoMetadata::new());
        for number in [1u64, 3] {
            let project = format!("SUSE:Maintenance:{}", number);
            let url = chan
                .compute_url(&RepoUrl::new(BASE).project(&project))
                .unwrap();
            source.insert_revision(&url, 10 + number);
        }
        let broken = chan
            .compute_url(&RepoUrl::new(BASE).project("SUSE:Maintenance:2"))
            .unwrap();
        source.insert_failure(&broken);
        let resolver = RevisionResolver::new(source.clone(), BASE);

        let raws = vec![
            raw(1, &["SUSE:Updates:FOO:1:x86_64"], &["a"]),
            raw(2, &["SUSE:Updates:FOO:1:x86_64"], &["b"]),
            raw(3, &["SUSE:Updates:FOO:1:x86_64"], &["c"]),
        ];
        let built = build_incidents(raws, &resolver, 2).await;
        let ids: Vec<u64> = built.iter().map(Incident::id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(built[1].revision_with_fallback("x86_64", "1"), Some(13));
        assert_eq!(source.calls(&broken), 1);
    }
}

//! Repository revision ("repohash") resolution.
//!
//! Each update repository publishes a `repodata/repomd.xml` whose
//! `{http://linux.duke.edu/metadata/repo}revision` element changes whenever
//! the repository content does. The scheduler uses the highest revision of a
//! channel group as the fingerprint that decides whether tests already ran.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use md5::{Digest, Md5};
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use tracing::{debug, info};

use crate::domain::channel::{product_name_from_project, ArchVer, RepoChannel, RepoUrl};
use crate::error::IncidentError;
use crate::gateway::{RepoMetadataSource, RepoReply};

/// XML namespace of the `repomd.xml` document.
pub const REPO_NAMESPACE: &[u8] = b"http://linux.duke.edu/metadata/repo";

/// Optional overrides for [`RevisionResolver::max_revision`].
#[derive(Debug, Clone, Default)]
pub struct RepoOptions {
    pub product_name: Option<String>,
    pub product_version: Option<String>,
    pub submission_id: Option<String>,
}

/// Computes repository revisions through a [`RepoMetadataSource`].
#[derive(Clone)]
pub struct RevisionResolver {
    source: Arc<dyn RepoMetadataSource>,
    download_url: String,
    repo_type: String,
}

impl RevisionResolver {
    pub fn new(source: Arc<dyn RepoMetadataSource>, download_url: impl Into<String>) -> Self {
        Self {
            source,
            download_url: download_url.into(),
            repo_type: "product".to_string(),
        }
    }

    /// Repository type directory used for SLFO-style projects.
    pub fn with_repo_type(mut self, repo_type: impl Into<String>) -> Self {
        self.repo_type = repo_type.into();
        self
    }

    /// Highest published revision over `repos`.
    ///
    /// A repository answering with a non-success status is skipped. Transport
    /// failures, unparsable metadata, or a missing revision abort the whole
    /// group with [`IncidentError::NoRepoFound`]. Returns 0 when nothing was
    /// found.
    pub async fn max_revision(
        &self,
        repos: &[RepoChannel],
        arch: &str,
        project: &str,
        options: &RepoOptions,
    ) -> Result<u64, IncidentError> {
        let skipped = match &options.submission_id {
            Some(id) => format!("Submission {} skipped", id),
            None => format!("Submission for project {} skipped", project),
        };
        let no_repo = |url: &str, reason: String| IncidentError::NoRepoFound {
            project: project.to_string(),
            url: url.to_string(),
            reason,
        };

        let mut max_rev = 0;
        for repo in repos {
            let product_name = options
                .product_name
                .clone()
                .or_else(|| product_name_from_project(&repo.version));
            let mut repo = repo.clone();
            if let Some(product_version) = &options.product_version {
                repo.product_version = product_version.clone();
            }

            let target = RepoUrl::new(&self.download_url)
                .project(project)
                .product_name(product_name.as_deref())
                .arch(arch)
                .repo_type(&self.repo_type);
            let url = repo
                .compute_url(&target)
                .map_err(|e| no_repo("", e.to_string()))?;
            debug!(version = %repo.version, url = %url, "Computing RepoHash");

            let body = match self.source.fetch(&url).await {
                Ok(RepoReply::Found(body)) => body,
                Ok(RepoReply::Missing { status }) => {
                    info!(url = %url, status, "Submission skipped: RepoHash metadata not found");
                    continue;
                }
                Err(err) => {
                    info!(url = %url, error = %err, "{}: RepoHash metadata not found", skipped);
                    return Err(no_repo(&url, err.to_string()));
                }
            };

            let revision = parse_revision(&body).map_err(|reason| {
                info!(url = %url, reason = %reason, "{}: RepoHash calculation failed", skipped);
                no_repo(&url, reason)
            })?;
            max_rev = max_rev.max(revision);
        }

        Ok(max_rev)
    }

    /// Resolve revisions for every `(arch, version)` group of `channels`.
    /// Groups resolving to 0 are left out.
    pub async fn resolve_groups(
        &self,
        channels: &BTreeSet<RepoChannel>,
        project: &str,
    ) -> Result<BTreeMap<ArchVer, u64>, IncidentError> {
        let mut groups: BTreeMap<ArchVer, Vec<RepoChannel>> = BTreeMap::new();
        for chan in channels {
            groups
                .entry(ArchVer::of_channel(chan))
                .or_default()
                .push(chan.clone());
        }

        let mut revisions = BTreeMap::new();
        for (archver, repos) in groups {
            let rev = self
                .max_revision(&repos, &archver.arch, project, &RepoOptions::default())
                .await?;
            if rev > 0 {
                revisions.insert(archver, rev);
            }
        }
        Ok(revisions)
    }
}

/// Extract the integer `revision` from a `repomd.xml` document.
pub fn parse_revision(body: &[u8]) -> Result<u64, String> {
    let mut reader = NsReader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_revision = false;
    loop {
        buf.clear();
        let (ns, event) = reader
            .read_resolved_event_into(&mut buf)
            .map_err(|e| format!("malformed metadata: {}", e))?;
        let in_repo_ns = matches!(ns, ResolveResult::Bound(Namespace(n)) if n == REPO_NAMESPACE);
        match event {
            Event::Start(e) if in_repo_ns && e.local_name().as_ref() == b"revision" => {
                in_revision = true;
            }
            Event::Empty(e) if in_repo_ns && e.local_name().as_ref() == b"revision" => {
                return Err("empty revision element".to_string());
            }
            Event::Text(text) if in_revision => {
                let text = text
                    .unescape()
                    .map_err(|e| format!("malformed revision text: {}", e))?;
                return text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| format!("revision `{}` is not a number: {}", text.trim(), e));
            }
            Event::End(_) if in_revision => {
                return Err("empty revision element".to_string());
            }
            Event::Eof => return Err("no revision tag found".to_string()),
            _ => {}
        }
    }
}

/// Merge several repohashes into one fingerprint: MD5 hex of
/// `"start" + concat(hashes)`. Order-sensitive.
pub fn merge_revisions<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"start");
    for hash in hashes {
        hasher.update(hash.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

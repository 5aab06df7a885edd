//! Update channel parsing and repository identifiers.
//!
//! Incident records name their repositories as colon-separated channel
//! strings such as `SUSE:Updates:SLE-Module-Basesystem:15-SP4:x86_64`. This
//! module turns them into [`RepoChannel`] values and knows how to compute the
//! download URL of the matching repository.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::UrlError;

/// Prefix shared by every maintenance update channel.
pub const UPDATES_PREFIX: &str = "SUSE:Updates:";

/// Architecture assumed for two-field channels (openSUSE-SLE style).
pub const DEFAULT_ARCH: &str = "x86_64";

/// Default metadata path below a repository root.
pub const REPOMD_PATH: &str = "repodata/repomd.xml";

const DEV_TOOLS_OBS: &str = "SLE-Module-Development-Tools-OBS";
const MANAGER_SERVER: &str = "SLE-Module-SUSE-Manager-Server";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.-](?:SP)?\d+)?").expect("static version pattern"));

static PULL_REQUEST_PRODUCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":PullRequest:\d+:(.+)$").expect("static product pattern"));

/// A single repository an incident publishes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoChannel {
    pub product: String,
    /// Product version, or the OBS project for SLFO-style channels.
    pub version: String,
    pub arch: String,
    /// When non-empty, `version` is a codestream version or OBS project.
    #[serde(default)]
    pub product_version: String,
}

impl RepoChannel {
    pub fn new(
        product: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            product: product.into(),
            version: version.into(),
            arch: arch.into(),
            product_version: String::new(),
        }
    }

    pub fn with_product_version(mut self, product_version: impl Into<String>) -> Self {
        self.product_version = product_version.into();
        self
    }

    /// openSUSE products publish a single repository for all architectures.
    pub fn is_opensuse(&self) -> bool {
        self.product.starts_with("openSUSE")
    }

    fn is_slfo(&self, project: Option<&str>) -> bool {
        project == Some("SLFO") || self.product.starts_with("SUSE:SLFO")
    }

    /// Directory name of the update repository below a maintenance project,
    /// e.g. `SUSE_Updates_SLE-Module-Basesystem_15-SP4_x86_64`.
    pub fn updates_dir(&self, arch: &str) -> String {
        if self.is_opensuse() {
            format!("SUSE_Updates_{}_{}", self.product, self.version)
        } else {
            format!("SUSE_Updates_{}_{}_{}", self.product, self.version, arch)
        }
    }

    /// Build the URL of a file inside this channel's repository.
    pub fn compute_url(&self, target: &RepoUrl<'_>) -> Result<String, UrlError> {
        let arch = target.arch.unwrap_or(&self.arch);

        if self.is_slfo(target.project) {
            let product = self.product.replace(':', ":/");
            let version = self.version.replace(':', ":/");
            let start = format!(
                "{}/{}:/{}/{}",
                target.base, product, version, target.repo_type
            );
            let Some(product_name) = target.product_name else {
                return Ok(format!("{}/{}", start, target.path));
            };
            if self.product_version.is_empty() {
                return Err(UrlError::MissingProductVersion {
                    product_name: product_name.to_string(),
                });
            }
            return Ok(format!(
                "{}/repo/{}-{}-{}/{}",
                start, product_name, self.product_version, arch, target.path
            ));
        }

        let url_base = match target.project {
            Some(project) => format!("{}/{}", target.base, project.replace(':', ":/")),
            None => target.base.to_string(),
        };
        Ok(format!("{}/{}/{}", url_base, self.updates_dir(arch), target.path))
    }
}

/// Where and how to address a repository for [`RepoChannel::compute_url`].
#[derive(Debug, Clone, Copy)]
pub struct RepoUrl<'a> {
    pub base: &'a str,
    pub project: Option<&'a str>,
    pub product_name: Option<&'a str>,
    pub arch: Option<&'a str>,
    pub path: &'a str,
    pub repo_type: &'a str,
}

impl<'a> RepoUrl<'a> {
    pub fn new(base: &'a str) -> Self {
        Self {
            base,
            project: None,
            product_name: None,
            arch: None,
            path: REPOMD_PATH,
            repo_type: "product",
        }
    }

    pub fn project(mut self, project: &'a str) -> Self {
        self.project = Some(project);
        self
    }

    pub fn product_name(mut self, product_name: Option<&'a str>) -> Self {
        self.product_name = product_name;
        self
    }

    pub fn arch(mut self, arch: &'a str) -> Self {
        self.arch = Some(arch);
        self
    }

    pub fn path(mut self, path: &'a str) -> Self {
        self.path = path;
        self
    }

    pub fn repo_type(mut self, repo_type: &'a str) -> Self {
        self.repo_type = repo_type;
        self
    }
}

/// Architecture plus truncated product version; the grouping key for
/// revision resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchVer {
    pub arch: String,
    pub version: String,
}

impl ArchVer {
    pub fn new(arch: impl Into<String>, version: &str) -> Self {
        Self {
            arch: arch.into(),
            version: truncate_version(version),
        }
    }

    pub fn of_channel(channel: &RepoChannel) -> Self {
        Self::new(channel.arch.clone(), &channel.version)
    }
}

/// Reduce a channel version to its leading numeric part:
/// `15-SP4-LTSS` becomes `15-SP4`, `5.3` stays `5.3`. Versions without a
/// leading number are returned unchanged.
pub fn truncate_version(version: &str) -> String {
    VERSION_PATTERN
        .find(version)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| version.to_string())
}

/// Product and version referenced by a template issue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProdVer {
    pub product: String,
    pub version: String,
}

impl ProdVer {
    /// Parse a `product:version` template value. Extra fields are ignored.
    pub fn parse(channel: &str) -> Option<Self> {
        let mut parts = channel.split(':');
        let product = parts.next()?;
        let version = parts.next()?;
        Some(Self {
            product: product.to_string(),
            version: version.to_string(),
        })
    }

    /// The channel this issue key expects on `arch`.
    pub fn channel(&self, arch: &str) -> RepoChannel {
        RepoChannel::new(self.product.clone(), self.version.clone(), arch)
    }
}

/// Parse raw incident channel strings.
///
/// Only `SUSE:Updates:` channels with two or three remaining fields are
/// kept; anything else is ignored. An empty result is for the caller to
/// judge.
pub fn parse_channels<I, S>(channels: I) -> BTreeSet<RepoChannel>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    channels
        .into_iter()
        .filter_map(|raw| parse_channel(raw.as_ref()))
        .filter(|chan| chan.product != DEV_TOOLS_OBS)
        .filter(|chan| !(chan.product == MANAGER_SERVER && chan.arch == "aarch64"))
        .collect()
}

fn parse_channel(raw: &str) -> Option<RepoChannel> {
    let rest = raw.strip_prefix(UPDATES_PREFIX)?;
    let fields: Vec<&str> = rest.split(':').collect();
    match fields.as_slice() {
        [product, version, arch] => Some(RepoChannel::new(*product, *version, *arch)),
        [product, version] => Some(RepoChannel::new(*product, *version, DEFAULT_ARCH)),
        _ => None,
    }
}

/// Product name encoded in a pull-request staging project
/// (`…:PullRequest:<n>:<product>`), if any.
pub fn product_name_from_project(project: &str) -> Option<String> {
    PULL_REQUEST_PRODUCT
        .captures(project)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

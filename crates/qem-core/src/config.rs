//! Bot settings and configuration files.
//!
//! * [`BotConfig`]: service endpoints, overridable from the environment.
//! * [`load_templates`]: product template files (YAML, `!concat` aware).
//! * [`load_singlearch`]: packages that only build for one architecture.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info};

use crate::domain::template::{string_map, JobTemplate};
use crate::error::ConfigError;
use crate::obs;

pub const DEFAULT_DASHBOARD_URL: &str = "http://dashboard.qam.suse.de/";
pub const DEFAULT_DOWNLOAD_URL: &str = "http://download.suse.de/ibs";
pub const DEFAULT_INCIDENT_DOWNLOAD_BASE: &str = "http://download.suse.de/ibs/SUSE:/Maintenance:/";
pub const DEFAULT_SMELT_URL: &str = "https://smelt.suse.de/";
pub const DEFAULT_OBS_REPO_TYPE: &str = "product";

/// Service endpoints used by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Dashboard base URL, with trailing slash.
    pub dashboard_url: String,
    /// Root of the repository download tree.
    pub download_url: String,
    /// Prefix for `INCIDENT_REPO` entries; the incident id is appended.
    pub incident_download_base: String,
    pub smelt_url: String,
    pub obs_repo_type: String,
    /// Set by CI runners, copied into `__CI_JOB_URL`.
    pub ci_job_url: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            dashboard_url: DEFAULT_DASHBOARD_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            incident_download_base: DEFAULT_INCIDENT_DOWNLOAD_BASE.to_string(),
            smelt_url: DEFAULT_SMELT_URL.to_string(),
            obs_repo_type: DEFAULT_OBS_REPO_TYPE.to_string(),
            ci_job_url: None,
        }
    }
}

impl BotConfig {
    /// Defaults overridden by `QEM_DASHBOARD_URL`, `QEM_DOWNLOAD_URL`,
    /// `QEM_INCIDENT_DOWNLOAD_BASE`, `QEM_SMELT_URL`, `QEM_OBS_REPO_TYPE`
    /// and `CI_JOB_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Self {
            dashboard_url: get("QEM_DASHBOARD_URL")
                .map(with_trailing_slash)
                .unwrap_or(defaults.dashboard_url),
            download_url: get("QEM_DOWNLOAD_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.download_url),
            incident_download_base: get("QEM_INCIDENT_DOWNLOAD_BASE")
                .map(with_trailing_slash)
                .unwrap_or(defaults.incident_download_base),
            smelt_url: get("QEM_SMELT_URL")
                .map(with_trailing_slash)
                .unwrap_or(defaults.smelt_url),
            obs_repo_type: get("QEM_OBS_REPO_TYPE").unwrap_or(defaults.obs_repo_type),
            ci_job_url: get("CI_JOB_URL"),
        }
    }
}

fn with_trailing_slash(url: String) -> String {
    if url.ends_with('/') {
        url
    } else {
        format!("{}/", url)
    }
}

// ---------------------------------------------------------------------------
// YAML documents
// ---------------------------------------------------------------------------

/// Parse YAML text, flattening `!concat` sequences and applying `<<` merge
/// keys.
pub fn parse_yaml(path: &Path, text: &str) -> Result<Value, ConfigError> {
    let yaml_err = |source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    };
    let raw: Value = serde_yaml::from_str(text).map_err(yaml_err)?;
    let mut value = resolve_tags(raw).map_err(|reason| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;
    value.apply_merge().map_err(yaml_err)?;
    Ok(value)
}

/// Replace every `!concat [a, [b, c], d]` with `[a, b, c, d]`.
fn resolve_tags(value: Value) -> Result<Value, String> {
    match value {
        Value::Tagged(tagged) => {
            if tagged.tag != "concat" {
                return Err(format!("unsupported tag {}", tagged.tag));
            }
            let Value::Sequence(items) = tagged.value else {
                return Err("expected a sequence for !concat".to_string());
            };
            let mut out = Vec::new();
            for item in items {
                match resolve_tags(item)? {
                    Value::Sequence(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Ok(Value::Sequence(out))
        }
        Value::Sequence(items) => items
            .into_iter()
            .map(resolve_tags)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(mapping) => {
            let mut out = serde_yaml::Mapping::with_capacity(mapping.len());
            for (key, value) in mapping {
                out.insert(key, resolve_tags(value)?);
            }
            Ok(Value::Mapping(out))
        }
        scalar => Ok(scalar),
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// `.yml`/`.yaml` files under `path` (non-recursive, sorted), or `path`
/// itself when it is a file.
pub fn yaml_files(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err)? {
        let entry_path = entry.map_err(io_err)?.path();
        let is_yaml = entry_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if is_yaml && entry_path.is_file() {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load one template file. `Ok(None)` for empty files and files without an
/// `incidents` section.
pub fn load_template_file(path: &Path) -> Result<Option<JobTemplate>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc = parse_yaml(path, &text)?;
    match doc {
        Value::Null => {
            info!(path = %path.display(), "Configuration skipped: file is empty");
            Ok(None)
        }
        Value::Mapping(_) => JobTemplate::from_yaml(path, doc),
        _ => Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: "top level is not a mapping".to_string(),
        }),
    }
}

/// Top-level `settings` of a configuration file, whether or not it
/// describes incident flavors. `Ok(None)` when there are none.
pub fn load_settings_file(path: &Path) -> Result<Option<BTreeMap<String, String>>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc = parse_yaml(path, &text)?;
    let Some(settings) = doc.get("settings").and_then(Value::as_mapping) else {
        return Ok(None);
    };
    string_map(settings)
        .map(Some)
        .map_err(|key| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: format!("setting `{}` is not a scalar", key),
        })
}

/// Load every product template under `path`. Unreadable or invalid files
/// are logged and skipped; only an unreadable `path` itself is an error.
pub fn load_templates(path: &Path) -> Result<Vec<JobTemplate>, ConfigError> {
    let mut templates = Vec::new();
    for file in yaml_files(path)? {
        match load_template_file(&file) {
            Ok(Some(template)) => {
                debug!(
                    path = %file.display(),
                    product = %template.product,
                    flavors = template.flavors.len(),
                    "Loaded template"
                );
                templates.push(template);
            }
            Ok(None) => {}
            Err(err) => obs::emit_template_rejected(&file.display().to_string(), &err),
        }
    }
    Ok(templates)
}

/// Package names listed in the single-arch file. A missing or unreadable
/// file yields an empty set.
pub fn load_singlearch(path: &Path) -> HashSet<String> {
    let Ok(text) = fs::read_to_string(path) else {
        debug!(path = %path.display(), "No single-arch package list");
        return HashSet::new();
    };
    match serde_yaml::from_str::<Option<Vec<String>>>(&text) {
        Ok(packages) => packages.unwrap_or_default().into_iter().collect(),
        Err(err) => {
            info!(path = %path.display(), error = %err, "Ignoring malformed single-arch list");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup_overrides() {
        let config = BotConfig::from_lookup(|key| match key {
            "QEM_DASHBOARD_URL" => Some("http://dash.local".to_string()),
            "QEM_DOWNLOAD_URL" => Some("http://dl.local/ibs/".to_string()),
            "CI_JOB_URL" => Some("https://ci/job/1".to_string()),
            "QEM_SMELT_URL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.dashboard_url, "http://dash.local/");
        assert_eq!(config.download_url, "http://dl.local/ibs");
        assert_eq!(config.smelt_url, DEFAULT_SMELT_URL);
        assert_eq!(config.ci_job_url.as_deref(), Some("https://ci/job/1"));
        assert_eq!(config.obs_repo_type, "product");
    }

    #[test]
    fn test_concat_flattens_nested() {
        let doc = parse_yaml(
            Path::new("t.yml"),
            r#"
base: &base [a, b]
all: !concat [*base, c, [d, e], !concat [[f], g]]
"#,
        )
        .unwrap();
        let all: Vec<String> = serde_yaml::from_value(doc["all"].clone()).unwrap();
        assert_eq!(all, vec!["a", "b", "c", "d", "e", "f", "g"]);
    }

    #[test]
    fn test_concat_requires_sequence() {
        let err = parse_yaml(Path::new("t.yml"), "x: !concat {a: 1}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(parse_yaml(Path::new("t.yml"), "x: !other [1]\n").is_err());
    }

    #[test]
    fn test_merge_keys_applied() {
        let doc = parse_yaml(
            Path::new("t.yml"),
            "defaults: &d {archs: [x86_64]}\nflavor:\n  <<: *d\n  issues: {}\n",
        )
        .unwrap();
        assert_eq!(doc["flavor"]["archs"][0], "x86_64");
    }
}

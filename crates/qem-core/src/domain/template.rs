//! Per-product job templates.
//!
//! A product file looks like:
//!
//! ```yaml
//! product: SLES
//! settings:
//!   VERSION: 15-SP4
//!   DISTRI: sle
//! incidents:
//!   FLAVOR:
//!     Server-DVD-Incidents:
//!       archs: [x86_64, aarch64]
//!       issues:
//!         OS_TEST_ISSUES: SLES:15-SP4
//! ```
//!
//! Files are validated into [`JobTemplate`] once at load time. A broken
//! flavor entry is dropped on its own; a file without `product`, `settings`,
//! `VERSION` or `DISTRI` is dropped as a whole.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::domain::channel::ProdVer;
use crate::error::{ConfigError, TemplateError};
use crate::obs;

/// Scheduling rules for one product.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub product: String,
    pub settings: BTreeMap<String, String>,
    /// Skip embargoed incidents for every flavor of this product.
    pub filter_embargoed: bool,
    /// Flavors in file order.
    pub flavors: Vec<FlavorRule>,
}

/// One flavor entry of a product template.
#[derive(Debug, Clone, PartialEq)]
pub struct FlavorRule {
    pub name: String,
    pub archs: Vec<String>,
    /// Issue key to channel, in file order.
    pub issues: Vec<(String, ProdVer)>,
    pub packages: Option<Vec<String>>,
    pub excluded_packages: Option<Vec<String>>,
    pub required_issues: Option<BTreeSet<String>>,
    pub aggregate_job: bool,
    pub aggregate_check_true: BTreeSet<String>,
    pub aggregate_check_false: BTreeSet<String>,
    /// A value of 0 counts as unset.
    pub override_priority: Option<i64>,
    pub params_expand: BTreeMap<String, String>,
}

impl JobTemplate {
    pub fn version(&self) -> &str {
        self.settings.get("VERSION").map(String::as_str).unwrap_or_default()
    }

    pub fn distri(&self) -> &str {
        self.settings.get("DISTRI").map(String::as_str).unwrap_or_default()
    }

    /// Validate a parsed document. `Ok(None)` when the file has no
    /// `incidents` section.
    pub fn from_yaml(path: &Path, doc: Value) -> Result<Option<Self>, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        let doc: TemplateDoc = serde_yaml::from_value(doc).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let settings = match doc.settings {
            Some(settings) if !settings.is_empty() => string_map(&settings)
                .map_err(|key| invalid(format!("setting `{}` is not a scalar", key)))?,
            _ => return Err(invalid("missing settings".to_string())),
        };
        let Some(product) = doc.product.filter(|p| !p.is_empty()) else {
            return Err(invalid("missing product".to_string()));
        };
        for key in ["VERSION", "DISTRI"] {
            if !settings.contains_key(key) {
                return Err(invalid(format!("settings lack {}", key)));
            }
        }

        let Some(incidents) = doc.incidents else {
            return Ok(None);
        };

        let source = path.display().to_string();
        let mut flavors = Vec::with_capacity(incidents.flavor.len());
        for (name, entry) in incidents.flavor {
            let Some(name) = scalar(&name) else {
                obs::emit_template_rejected(&source, &"flavor name is not a scalar");
                continue;
            };
            match FlavorRule::from_yaml(name, entry) {
                Ok(rule) => flavors.push(rule),
                Err(err) => obs::emit_template_rejected(&source, &err),
            }
        }

        Ok(Some(Self {
            product,
            settings,
            filter_embargoed: doc.filter_embargoed,
            flavors,
        }))
    }
}

impl FlavorRule {
    /// A rule with only the required keys set.
    pub fn new(name: impl Into<String>, archs: &[&str], issues: &[(&str, &str)]) -> Self {
        Self {
            name: name.into(),
            archs: archs.iter().map(|a| a.to_string()).collect(),
            issues: issues
                .iter()
                .filter_map(|(key, chan)| ProdVer::parse(chan).map(|pv| (key.to_string(), pv)))
                .collect(),
            packages: None,
            excluded_packages: None,
            required_issues: None,
            aggregate_job: true,
            aggregate_check_true: BTreeSet::new(),
            aggregate_check_false: BTreeSet::new(),
            override_priority: None,
            params_expand: BTreeMap::new(),
        }
    }

    fn from_yaml(name: String, entry: Value) -> Result<Self, TemplateError> {
        let doc: FlavorDoc =
            serde_yaml::from_value(entry).map_err(|e| TemplateError::InvalidValue {
                flavor: name.clone(),
                key: "entry",
                reason: e.to_string(),
            })?;

        let archs = doc.archs.ok_or_else(|| TemplateError::MissingKey {
            flavor: name.clone(),
            key: "archs",
        })?;
        let raw_issues = doc.issues.ok_or_else(|| TemplateError::MissingKey {
            flavor: name.clone(),
            key: "issues",
        })?;

        let mut issues = Vec::with_capacity(raw_issues.len());
        for (key, value) in &raw_issues {
            let key = scalar(key).unwrap_or_default();
            let channel = scalar(value).unwrap_or_default();
            let prodver = ProdVer::parse(&channel).ok_or_else(|| TemplateError::MalformedIssue {
                flavor: name.clone(),
                issue: key.clone(),
                channel: channel.clone(),
            })?;
            issues.push((key, prodver));
        }

        let params_expand = match doc.params_expand {
            Some(params) => string_map(&params).map_err(|key| TemplateError::InvalidValue {
                flavor: name.clone(),
                key: "params_expand",
                reason: format!("`{}` is not a scalar", key),
            })?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            name,
            archs,
            issues,
            packages: doc.packages,
            excluded_packages: doc.excluded_packages,
            required_issues: doc.required_issues.map(|r| r.into_iter().collect()),
            aggregate_job: doc.aggregate_job.unwrap_or(true),
            aggregate_check_true: doc.aggregate_check_true.into_iter().flatten().collect(),
            aggregate_check_false: doc.aggregate_check_false.into_iter().flatten().collect(),
            override_priority: doc.override_priority.filter(|p| *p != 0),
            params_expand,
        })
    }
}

// ---------------------------------------------------------------------------
// Raw document shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TemplateDoc {
    product: Option<String>,
    settings: Option<Mapping>,
    #[serde(default)]
    filter_embargoed: bool,
    incidents: Option<IncidentsDoc>,
}

#[derive(Debug, Deserialize)]
struct IncidentsDoc {
    #[serde(rename = "FLAVOR", default)]
    flavor: Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlavorDoc {
    archs: Option<Vec<String>>,
    issues: Option<Mapping>,
    packages: Option<Vec<String>>,
    excluded_packages: Option<Vec<String>>,
    required_issues: Option<Vec<String>>,
    aggregate_job: Option<bool>,
    aggregate_check_true: Option<Vec<String>>,
    aggregate_check_false: Option<Vec<String>>,
    override_priority: Option<i64>,
    params_expand: Option<Mapping>,
}

/// Render a YAML scalar the way job settings expect it.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Convert a mapping of scalars; the error carries the offending key.
pub(crate) fn string_map(mapping: &Mapping) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for (key, value) in mapping {
        let key_str = scalar(key).unwrap_or_else(|| format!("{:?}", key));
        let value = match value {
            Value::Null => String::new(),
            other => scalar(other).ok_or_else(|| key_str.clone())?,
        };
        out.insert(key_str, value);
    }
    Ok(out)
}

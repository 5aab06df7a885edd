//! Public-cloud image resolution for job settings.
//!
//! Two lookups rewrite settings before a job is requested:
//!
//! - `PUBLIC_CLOUD_TOOLS_IMAGE_QUERY` points at an openQA group overview; the
//!   newest build without failures names the tools image.
//! - `PUBLIC_CLOUD_PINT_QUERY` points at a pint endpoint; the most recently
//!   published image matching name, state and region is selected.
//!
//! Catalog answers for both lookups are cached per resolver, so one
//! scheduling run fetches each distinct query once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{CloudImageError, FetchError};
use crate::gateway::CloudImageSource;

pub const TOOLS_IMAGE_QUERY: &str = "PUBLIC_CLOUD_TOOLS_IMAGE_QUERY";
pub const TOOLS_IMAGE_BASE: &str = "PUBLIC_CLOUD_TOOLS_IMAGE_BASE";
pub const PINT_QUERY: &str = "PUBLIC_CLOUD_PINT_QUERY";
pub const PINT_NAME: &str = "PUBLIC_CLOUD_PINT_NAME";
pub const PINT_FIELD: &str = "PUBLIC_CLOUD_PINT_FIELD";
pub const PINT_REGION: &str = "PUBLIC_CLOUD_PINT_REGION";
pub const CLOUD_REGION: &str = "PUBLIC_CLOUD_REGION";
pub const IMAGE_ID: &str = "PUBLIC_CLOUD_IMAGE_ID";
pub const IMAGE_NAME: &str = "PUBLIC_CLOUD_IMAGE_NAME";
pub const IMAGE_STATE: &str = "PUBLIC_CLOUD_IMAGE_STATE";

/// Image states tried in order; the first state with a match wins.
pub const PINT_STATES: [&str; 3] = ["active", "inactive", "deprecated"];

// ---------------------------------------------------------------------------
// ImageQueryCache
// ---------------------------------------------------------------------------

/// Memoised JSON answers keyed by query URL.
///
/// Concurrent callers for the same URL share one in-flight request. Failed
/// fetches are not stored.
#[derive(Debug, Default)]
pub struct ImageQueryCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Value>>>>,
}

impl ImageQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(
        &self,
        url: &str,
        source: &dyn CloudImageSource,
    ) -> Result<Value, FetchError> {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(url.to_string()).or_default().clone()
        };
        cell.get_or_try_init(|| async move {
            debug!(url = %url, "Querying image catalog");
            source.get_json(url).await
        })
        .await
        .cloned()
    }

    /// Number of distinct queries seen.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// CloudImageResolver
// ---------------------------------------------------------------------------

pub struct CloudImageResolver {
    source: Arc<dyn CloudImageSource>,
    cache: ImageQueryCache,
}

impl CloudImageResolver {
    pub fn new(source: Arc<dyn CloudImageSource>) -> Self {
        Self {
            source,
            cache: ImageQueryCache::new(),
        }
    }

    pub fn cache(&self) -> &ImageQueryCache {
        &self.cache
    }

    /// Apply every lookup whose query key is present in `settings`.
    pub async fn enrich(&self, settings: &mut BTreeMap<String, String>) -> Result<(), CloudImageError> {
        if settings.contains_key(TOOLS_IMAGE_QUERY) {
            self.apply_tools_image(settings).await?;
        }
        if settings.contains_key(PINT_QUERY) {
            self.apply_pint_image(settings).await?;
        }
        Ok(())
    }

    /// `publiccloud_tools_{build}.qcow2` for the first build without failures.
    pub async fn latest_tools_image(&self, query: &str) -> Result<String, CloudImageError> {
        let body = self.cache.get_or_fetch(query, self.source.as_ref()).await?;
        let builds = body
            .get("build_results")
            .and_then(Value::as_array)
            .ok_or_else(|| CloudImageError::Shape {
                query: query.to_string(),
                reason: "missing build_results".to_string(),
            })?;

        builds
            .iter()
            .find(|b| b.get("failed").and_then(Value::as_i64) == Some(0))
            .and_then(|b| b.get("build"))
            .and_then(json_scalar)
            .map(|build| format!("publiccloud_tools_{}.qcow2", build))
            .ok_or_else(|| CloudImageError::NoImage {
                name: query.to_string(),
            })
    }

    /// Replace the tools image query with the resolved image. The query key
    /// is removed even on failure.
    pub async fn apply_tools_image(
        &self,
        settings: &mut BTreeMap<String, String>,
    ) -> Result<(), CloudImageError> {
        let query = settings
            .remove(TOOLS_IMAGE_QUERY)
            .ok_or(CloudImageError::MissingSetting(TOOLS_IMAGE_QUERY))?;
        let image = self.latest_tools_image(&query).await?;
        settings.insert(TOOLS_IMAGE_BASE.to_string(), image);
        Ok(())
    }

    /// Resolve the pint image and set `PUBLIC_CLOUD_IMAGE_{ID,NAME,STATE}`.
    ///
    /// All `PUBLIC_CLOUD_PINT_*` keys are consumed; a configured region is
    /// carried over as `PUBLIC_CLOUD_REGION`.
    pub async fn apply_pint_image(
        &self,
        settings: &mut BTreeMap<String, String>,
    ) -> Result<(), CloudImageError> {
        let query = settings.remove(PINT_QUERY);
        let name = settings.remove(PINT_NAME);
        let field = settings.remove(PINT_FIELD);
        let region = settings.remove(PINT_REGION);
        if let Some(region) = &region {
            settings.insert(CLOUD_REGION.to_string(), region.clone());
        }

        let query = query.ok_or(CloudImageError::MissingSetting(PINT_QUERY))?;
        let name = name.ok_or(CloudImageError::MissingSetting(PINT_NAME))?;
        let field = field.ok_or(CloudImageError::MissingSetting(PINT_FIELD))?;

        let (image, state) = self.find_pint_image(&query, &name, region.as_deref()).await?;
        let id = image
            .get(&field)
            .and_then(json_scalar)
            .ok_or_else(|| CloudImageError::Shape {
                query: query.clone(),
                reason: format!("image lacks field `{}`", field),
            })?;
        let image_name = image.get("name").and_then(json_scalar).unwrap_or_default();

        settings.insert(IMAGE_ID.to_string(), id);
        settings.insert(IMAGE_NAME.to_string(), image_name);
        settings.insert(IMAGE_STATE.to_string(), state.to_string());
        Ok(())
    }

    /// Newest image matching `name` over [`PINT_STATES`], with its state.
    pub async fn find_pint_image(
        &self,
        query: &str,
        name: &str,
        region: Option<&str>,
    ) -> Result<(Value, &'static str), CloudImageError> {
        let pattern = Regex::new(&format!("^(?:{})", name)).map_err(|source| {
            CloudImageError::InvalidPattern {
                pattern: name.to_string(),
                source,
            }
        })?;

        for state in PINT_STATES {
            let url = format!("{}{}.json", query, state);
            let body = self.cache.get_or_fetch(&url, self.source.as_ref()).await?;
            let images = body
                .get("images")
                .and_then(Value::as_array)
                .ok_or_else(|| CloudImageError::Shape {
                    query: url.clone(),
                    reason: "missing images".to_string(),
                })?;
            if let Some(image) = recent_pint_image(images, &pattern, region, state) {
                return Ok((image.clone(), state));
            }
        }

        Err(CloudImageError::NoImage {
            name: name.to_string(),
        })
    }
}

/// Most recently published image whose name matches `name`, in `state`,
/// and in `region` unless `region` is empty or absent.
pub fn recent_pint_image<'a>(
    images: &'a [Value],
    name: &Regex,
    region: Option<&str>,
    state: &str,
) -> Option<&'a Value> {
    let region = region.filter(|r| !r.is_empty());
    let mut recent: Option<(&Value, NaiveDate)> = None;

    for image in images {
        let Some(image_name) = image.get("name").and_then(Value::as_str) else {
            continue;
        };
        if !name.is_match(image_name) {
            continue;
        }
        if image.get("state").and_then(Value::as_str) != Some(state) {
            continue;
        }
        if let Some(region) = region {
            if image.get("region").and_then(Value::as_str) != Some(region) {
                continue;
            }
        }
        let Some(published) = image
            .get("publishedon")
            .and_then(json_scalar)
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok())
        else {
            debug!(image = %image_name, "Ignoring image without usable publishedon");
            continue;
        };
        if recent.map_or(true, |(_, date)| published > date) {
            recent = Some((image, published));
        }
    }

    recent.map(|(image, _)| image)
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

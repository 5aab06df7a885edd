//! Error taxonomy for the scheduling core.

use std::path::PathBuf;

/// Reasons an incident record cannot take part in scheduling.
///
/// Any of these drops the whole incident from the run; the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum IncidentError {
    #[error("incident {project} has no usable update channels")]
    EmptyChannels { project: String },

    #[error("incident {project} has no packages")]
    EmptyPackages { project: String },

    #[error("no repository metadata for {project} at {url}: {reason}")]
    NoRepoFound {
        project: String,
        url: String,
        reason: String,
    },
}

/// Failures talking to a remote service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Connection problems, timeouts and 5xx answers are worth another attempt.
    /// Everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Decode(_) => false,
        }
    }
}

/// Problems building a repository URL from a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("product version must be provided for {product_name}")]
    MissingProductVersion { product_name: String },
}

/// A single flavor entry of a product template is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("flavor {flavor}: missing required key `{key}`")]
    MissingKey { flavor: String, key: &'static str },

    #[error("flavor {flavor}: issue {issue} has malformed channel `{channel}`")]
    MalformedIssue {
        flavor: String,
        issue: String,
        channel: String,
    },

    #[error("flavor {flavor}: invalid value for `{key}`: {reason}")]
    InvalidValue {
        flavor: String,
        key: &'static str,
        reason: String,
    },
}

/// Loading configuration files failed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Public-cloud image lookup failed; the affected job is dropped.
#[derive(Debug, thiserror::Error)]
pub enum CloudImageError {
    #[error("image query failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("missing setting `{0}`")]
    MissingSetting(&'static str),

    #[error("invalid image name pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unexpected response from {query}: {reason}")]
    Shape { query: String, reason: String },

    #[error("no usable image for `{name}`")]
    NoImage { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Transport("reset".to_string()).is_transient());
        assert!(FetchError::Timeout("30s".to_string()).is_transient());
        assert!(FetchError::Status {
            status: 503,
            url: "http://x".to_string()
        }
        .is_transient());
        assert!(!FetchError::Status {
            status: 404,
            url: "http://x".to_string()
        }
        .is_transient());
        assert!(!FetchError::Decode("bad json".to_string()).is_transient());
    }

    #[test]
    fn test_incident_error_display() {
        let err = IncidentError::EmptyChannels {
            project: "SUSE:Maintenance:1".to_string(),
        };
        assert!(err.to_string().contains("SUSE:Maintenance:1"));

        let err = IncidentError::NoRepoFound {
            project: "SUSE:Maintenance:1".to_string(),
            url: "http://download/repomd.xml".to_string(),
            reason: "no revision".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("repomd.xml"));
        assert!(msg.contains("no revision"));
    }
}

//! QEM bot core library
//!
//! Decides which openQA jobs each open maintenance incident needs. The
//! remote services it talks to sit behind the traits in [`gateway`]; see
//! the `qem-http` crate for the HTTP implementations.

pub mod cloud;
pub mod config;
pub mod domain;
pub mod error;
pub mod fakes;
pub mod gateway;
pub mod obs;
pub mod repohash;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use cloud::{CloudImageResolver, ImageQueryCache};
pub use config::{load_singlearch, load_templates, BotConfig};
pub use domain::{
    build_incidents, parse_channels, ArchVer, FlavorRule, Incident, JobRequest, JobTemplate,
    ProdVer, QemSection, RawIncident, RepoChannel,
};
pub use error::{CloudImageError, ConfigError, FetchError, IncidentError, TemplateError, UrlError};
pub use gateway::{CloudImageSource, DashboardGateway, RepoMetadataSource, RepoReply, ScheduledJob};
pub use repohash::{merge_revisions, RepoOptions, RevisionResolver};
pub use retry::RetryPolicy;
pub use scheduler::{Decision, SchedulerOptions, SchedulingEngine, SkipReason};
pub use telemetry::init_tracing;

/// Crate version, reported in the HTTP user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

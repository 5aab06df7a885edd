//! Domain models for the scheduler.
//!
//! - `channel`: update channels, repository URLs, version grouping keys
//! - `incident`: validated incidents with resolved revisions
//! - `template`: per-product flavor rules
//! - `job`: the requests handed to the dashboard

pub mod channel;
pub mod incident;
pub mod job;
pub mod template;

pub use channel::{parse_channels, ArchVer, ProdVer, RepoChannel, RepoUrl};
pub use incident::{build_incidents, Incident, RawIncident};
pub use job::{JobRequest, QemSection};
pub use template::{FlavorRule, JobTemplate};

//! Structured lifecycle events for a scheduling run.
//!
//! Every hook logs with an `event` field so runs can be followed in JSON
//! output (`--json`) without parsing messages.

use tracing::{debug, info, warn};

/// Span tagging everything logged during one scheduling run.
///
/// Attach it with [`tracing::Instrument`]; the run is async, so an entered
/// guard would leak across await points.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("qem.run", run_id = %run_id)
}

pub fn emit_run_started(templates: usize, incidents: usize) {
    info!(event = "run.started", templates, incidents);
}

pub fn emit_run_finished(requests: usize, duration_ms: u64) {
    info!(event = "run.finished", requests, duration_ms);
}

/// Incident could not be built and takes no part in the run.
pub fn emit_incident_dropped(incident: u64, error: &dyn std::fmt::Display) {
    warn!(event = "incident.dropped", incident, error = %error);
}

/// A (flavor, arch, incident) triple was filtered out.
pub fn emit_job_skipped(incident: u64, flavor: &str, arch: &str, reason: &str) {
    debug!(
        event = "job.skipped",
        incident,
        flavor = %flavor,
        arch = %arch,
        reason = %reason,
    );
}

pub fn emit_job_scheduled(incident: u64, flavor: &str, arch: &str, repohash: &str) {
    info!(
        event = "job.scheduled",
        incident,
        flavor = %flavor,
        arch = %arch,
        repohash = %repohash,
    );
}

/// Cloud image lookup failed; the job is dropped.
pub fn emit_image_unresolved(incident: u64, flavor: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.image_unresolved", incident, flavor = %flavor, error = %error);
}

/// A template file or flavor entry was rejected at load time.
pub fn emit_template_rejected(source: &str, error: &dyn std::fmt::Display) {
    warn!(event = "template.rejected", source = %source, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("incidents-run").entered();
        emit_job_skipped(1, "Server-DVD-Incidents", "x86_64", "staging");
    }
}

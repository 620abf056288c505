//! Resuming sessions saved before a restart

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::load::LOAD_TIMEOUT_MARGIN;
use crate::manager::{BeginRequest, ResumeState, SessionManager};

/// How a resume pass runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Rescan local image directories first
    pub rescan: bool,
    /// The device only just booted; the push feed will re-deliver images
    pub just_rebooted: bool,
}

/// What a resume pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub resumed: usize,
    pub retained: usize,
}

/// Try to restart every queued session
///
/// Entries that cannot start now (no eligible image, no free slot) stay
/// queued for the next pass. Runs on the actor, so passes never overlap.
pub fn resume_pending(
    manager: &mut SessionManager,
    options: ResumeOptions,
    now: Instant,
    wall: DateTime<Utc>,
) -> ResumeReport {
    let queue = manager.take_pending();
    if queue.is_empty() {
        return ResumeReport::default();
    }

    if options.rescan && !options.just_rebooted {
        let added = manager.scan_images();
        debug!(added, "Rescanned images before resume");
    }

    let mut report = ResumeReport::default();
    let mut retained = Vec::new();

    for entry in queue {
        if manager.is_controller_updating(&entry.key) {
            debug!(key = %entry.key, "Controller already has a live session, dropping saved entry");
            continue;
        }

        let query = entry.query();
        let Some(candidate) = manager.find_update(&query) else {
            debug!(key = %entry.key, "No eligible image for saved session");
            retained.push(entry);
            continue;
        };

        let pre_armed = match entry.time_to_load() {
            Some(at) if at > wall => {
                let delay = (at - wall).to_std().unwrap_or_default();
                manager.arm_timeout(entry.key, delay.saturating_add(LOAD_TIMEOUT_MARGIN), now);
                true
            }
            _ => false,
        };

        let request = BeginRequest::new(
            entry.key,
            candidate.id,
            entry.hardware,
            entry.bootloader,
            entry.software,
        )
        .with_query(&query)
        .with_manual_poll(entry.manual_poll)
        .with_resume(ResumeState::from(&entry));

        match manager.begin(request, now) {
            Ok(outcome) => {
                info!(
                    "Resumed session {} for controller {}: {:?}",
                    entry.session_id, entry.key, outcome
                );
                report.resumed += 1;
            }
            Err(e) => {
                warn!("Could not resume session {}: {}", entry.session_id, e);
                if pre_armed {
                    manager.cancel_timeout(&entry.key);
                }
                retained.push(entry);
            }
        }
    }

    report.retained = retained.len();
    if retained.is_empty() {
        info!("Resume queue drained");
    }
    manager.restore_pending(retained);
    manager.persist();
    report
}

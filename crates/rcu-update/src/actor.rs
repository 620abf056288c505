//! Single-consumer worker loop
//!
//! All session state changes happen here, one message at a time. Between
//! messages the loop sleeps until the next session deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use rcu_image::ImageInfo;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::load::LoadInfo;
use crate::manager::{BeginOutcome, BeginRequest, DownloadStart, LoadStart, SessionManager};
use crate::events::SessionResult;
use crate::resume::{self, ResumeOptions};
use crate::session::ControllerKey;

/// Reply channel for request messages
pub(crate) type Reply<T> = Sender<UpdateResult<T>>;

/// Messages understood by the actor
#[derive(Debug)]
pub(crate) enum Message {
    Begin {
        request: BeginRequest,
        reply: Reply<BeginOutcome>,
    },
    End {
        key: ControllerKey,
        image_id: usize,
        result: SessionResult,
        reply: Reply<()>,
    },
    LoadInfo {
        key: ControllerKey,
        image_id: usize,
        reply: Reply<LoadInfo>,
    },
    InteractiveDownloadStart {
        session_id: u64,
        start: DownloadStart,
        reply: Reply<()>,
    },
    InteractiveLoadStart {
        session_id: u64,
        start: LoadStart,
        reply: Reply<()>,
    },
    ConfigChanged {
        key: String,
        value: Value,
        reply: Reply<()>,
    },
    Stage {
        key: ControllerKey,
        image_id: usize,
    },
    Unstage {
        key: ControllerKey,
        image_id: usize,
    },
    ReadNextChunk {
        key: ControllerKey,
        image_id: usize,
    },
    Reload {
        key: ControllerKey,
        image_id: usize,
        offset: u64,
    },
    DownloadStarted {
        key: ControllerKey,
        image_id: usize,
    },
    DownloadComplete {
        key: ControllerKey,
        image_id: usize,
    },
    Activity {
        key: ControllerKey,
        timeout_override: Option<Duration>,
    },
    ProcessExternalPush {
        path: PathBuf,
        explicit_id: Option<usize>,
    },
    ResumeCheck {
        options: ResumeOptions,
    },
    Terminate {
        ack: Sender<()>,
    },
}

/// Message with its archive work already done outside the manager lock
enum Prepared {
    Push {
        path: PathBuf,
        explicit_id: Option<usize>,
        inspected: UpdateResult<ImageInfo>,
    },
    Resume {
        options: ResumeOptions,
        scanned: Option<Vec<ImageInfo>>,
    },
    Other(Message),
}

/// Actor thread body
pub(crate) fn run(manager: Arc<RwLock<SessionManager>>, rx: Receiver<Message>) {
    info!("Update actor started");
    let mut last_scan = Instant::now();

    loop {
        let (deadline, next_scan) = {
            let manager = manager.read();
            (
                manager.next_deadline(),
                last_scan.checked_add(manager.config().image_poll_interval),
            )
        };
        let wake = match (deadline, next_scan) {
            (Some(deadline), Some(scan)) => Some(deadline.min(scan)),
            (deadline, scan) => deadline.or(scan),
        };
        let message = match wake {
            Some(wake) => match rx.recv_deadline(wake) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(message) => Some(message),
                Err(_disconnected) => break,
            },
        };

        let now = Instant::now();
        let scan_due = next_scan.is_some_and(|scan| now >= scan);
        let timer_due = deadline.is_some_and(|deadline| now >= deadline);
        if message.is_none() && !scan_due && !timer_due {
            continue;
        }

        // Archive extraction happens here, with getters still served
        let scanned = if scan_due {
            last_scan = now;
            Some(detached_scan(&manager))
        } else {
            None
        };
        let prepared = message.map(|message| prepare(&manager, message));

        let mut manager = manager.write();
        manager.expire_timeouts(now);
        if let Some(found) = scanned {
            publish_scan(&mut manager, found, now);
        }

        match prepared {
            Some(Prepared::Other(Message::Terminate { ack })) => {
                drain(&rx);
                manager.terminate();
                let _ = ack.send(());
                info!("Update actor stopped");
                return;
            }
            Some(Prepared::Other(message)) => dispatch(&mut manager, message, now),
            Some(Prepared::Push {
                path,
                explicit_id,
                inspected,
            }) => {
                match inspected.and_then(|entry| manager.publish_external_push(entry, explicit_id)) {
                    Ok(id) => {
                        info!("External push {} cataloged as image {}", path.display(), id);
                        resume::resume_pending(&mut manager, ResumeOptions::default(), now, Utc::now());
                    }
                    Err(e) => warn!("External push {} rejected: {}", path.display(), e),
                }
            }
            Some(Prepared::Resume { options, scanned }) => {
                if let Some(found) = scanned {
                    let added = manager.publish_images(found);
                    debug!(added, "Rescanned images before resume");
                }
                let report = resume::resume_pending(&mut manager, options, now, Utc::now());
                debug!(report = ?report, "Resume check");
            }
            None => {}
        }
    }

    warn!("Update actor channel closed without terminate");
    manager.write().terminate();
}

fn detached_scan(manager: &RwLock<SessionManager>) -> Vec<ImageInfo> {
    let scan = manager.read().image_scan();
    scan.run()
}

/// Do a message's archive work under the read lock only
fn prepare(manager: &RwLock<SessionManager>, message: Message) -> Prepared {
    match message {
        Message::ProcessExternalPush { path, explicit_id } => {
            let inspector = manager.read().push_inspector(&path, explicit_id);
            let inspected = inspector.and_then(|inspector| inspector.inspect(&path).map_err(UpdateError::from));
            Prepared::Push {
                path,
                explicit_id,
                inspected,
            }
        }
        Message::ResumeCheck { options } => {
            let scanned = (options.rescan && !options.just_rebooted).then(|| detached_scan(manager));
            Prepared::Resume {
                options: ResumeOptions {
                    rescan: false,
                    ..options
                },
                scanned,
            }
        }
        message => Prepared::Other(message),
    }
}

/// Periodic rescan; new images may unblock saved sessions
fn publish_scan(manager: &mut SessionManager, found: Vec<ImageInfo>, now: Instant) {
    let added = manager.publish_images(found);
    debug!(added, "Periodic image scan");
    if added > 0 && !manager.pending().is_empty() {
        let report = resume::resume_pending(manager, ResumeOptions::default(), now, Utc::now());
        debug!(report = ?report, "Resume after image scan");
    }
}

fn dispatch(manager: &mut SessionManager, message: Message, now: Instant) {
    match message {
        Message::Begin { request, reply } => {
            let _ = reply.send(manager.begin(request, now));
        }
        Message::End {
            key,
            image_id,
            result,
            reply,
        } => {
            let _ = reply.send(manager.end(key, image_id, result));
        }
        Message::LoadInfo {
            key,
            image_id,
            reply,
        } => {
            let wall = Local::now().fixed_offset();
            let _ = reply.send(manager.load_info(key, image_id, wall, now));
        }
        Message::InteractiveDownloadStart {
            session_id,
            start,
            reply,
        } => {
            let _ = reply.send(manager.interactive_download_start(session_id, start));
        }
        Message::InteractiveLoadStart {
            session_id,
            start,
            reply,
        } => {
            let _ = reply.send(manager.interactive_load_start(session_id, start));
        }
        Message::ConfigChanged { key, value, reply } => {
            let _ = reply.send(manager.apply_attribute(&key, &value));
        }
        Message::Stage { key, image_id } => log_failure("stage", manager.stage(key, image_id, now)),
        Message::Unstage { key, image_id } => log_failure("unstage", manager.unstage(key, image_id)),
        Message::ReadNextChunk { key, image_id } => {
            log_failure("read next chunk", manager.read_next_chunk(key, image_id));
        }
        Message::Reload {
            key,
            image_id,
            offset,
        } => log_failure("reload", manager.reload(key, image_id, offset)),
        Message::DownloadStarted { key, image_id } => manager.download_started(key, image_id),
        Message::DownloadComplete { key, image_id } => manager.download_complete(key, image_id),
        Message::Activity {
            key,
            timeout_override,
        } => manager.touch(key, timeout_override, now),
        Message::ProcessExternalPush { path, .. } => {
            debug!(path = ?path, "External push reached dispatch unprepared");
        }
        Message::ResumeCheck { .. } => debug!("Resume check reached dispatch unprepared"),
        Message::Terminate { ack } => {
            // Handled by the loop
            let _ = ack.send(());
        }
    }
}

fn log_failure(operation: &str, result: UpdateResult<()>) {
    if let Err(e) = result {
        debug!(operation, error = %e, "Queued operation failed");
    }
}

/// Answer queued requests with `ServiceStopped` and drop the rest
fn drain(rx: &Receiver<Message>) {
    let mut dropped = 0usize;
    while let Ok(message) = rx.try_recv() {
        match message {
            Message::Begin { reply, .. } => {
                let _ = reply.send(Err(UpdateError::ServiceStopped));
            }
            Message::LoadInfo { reply, .. } => {
                let _ = reply.send(Err(UpdateError::ServiceStopped));
            }
            Message::End { reply, .. }
            | Message::InteractiveDownloadStart { reply, .. }
            | Message::InteractiveLoadStart { reply, .. }
            | Message::ConfigChanged { reply, .. } => {
                let _ = reply.send(Err(UpdateError::ServiceStopped));
            }
            Message::Terminate { ack } => {
                let _ = ack.send(());
            }
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "Dropped queued operations at shutdown");
    }
}

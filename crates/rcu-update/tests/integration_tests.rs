//! End-to-end tests driving the update service through its public API

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use rcu_update::prelude::*;
use tokio::sync::broadcast;

const IMAGE_SIZE: usize = 10_000;
const READ_SIZE: usize = 96;

fn build_archive(dir: &Path, name: &str, version: &str, payload: &[u8]) -> io::Result<PathBuf> {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<image>
  <productName>XR15-10</productName>
  <type>firmware</type>
  <version>{version}</version>
  <bootloaderVersionMin>1.0.0.0</bootloaderVersionMin>
  <hwVersionMin>2.3.0.0</hwVersionMin>
  <fileName>xr15_fw.bin</fileName>
  <size>{}</size>
  <crc>0xC0FFEE</crc>
</image>"#,
        payload.len()
    );

    let path = dir.join(name);
    let mut builder = tar::Builder::new(GzEncoder::new(File::create(&path)?, Compression::fast()));

    let mut header = tar::Header::new_gnu();
    header.set_size(xml.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "image.xml", xml.as_bytes())?;

    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "xr15_fw.bin", payload)?;

    builder.into_inner()?.finish()?;
    Ok(path)
}

fn payload() -> Vec<u8> {
    (0..IMAGE_SIZE).map(|i| (i * 7 % 251) as u8).collect()
}

struct Setup {
    images: tempfile::TempDir,
    temp: tempfile::TempDir,
}

fn setup() -> Result<Setup> {
    rcu_update::logging::try_init("rcu_update=info,rcu_image=info");
    let images = tempfile::tempdir()?;
    let temp = tempfile::tempdir()?;
    build_archive(images.path(), "xr15_2.0.0.0.tgz", "2.0.0.0", &payload())?;
    Ok(Setup { images, temp })
}

fn config(setup: &Setup) -> Result<UpdateConfig> {
    Ok(UpdateConfig::builder()
        .update_dir(setup.images.path())
        .temp_path(setup.temp.path())
        .load_immediately(true)
        .build()?)
}

fn query() -> UpdateQuery {
    UpdateQuery {
        image_type: ImageType::Firmware,
        controller_type: "XR15-10".to_string(),
        hardware: HardwareVersion::new(2, 3, 1, 0),
        bootloader: SoftwareVersion::new(1, 0, 0, 0),
        software: SoftwareVersion::new(1, 9, 9, 9),
        audio_theme: AudioTheme::INVALID,
        type_z: false,
    }
}

fn request(key: ControllerKey, image_id: usize) -> BeginRequest {
    BeginRequest::new(
        key,
        image_id,
        HardwareVersion::new(2, 3, 1, 0),
        SoftwareVersion::new(1, 0, 0, 0),
        SoftwareVersion::new(1, 9, 9, 9),
    )
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

/// Pull the whole image the way a remote does, retrying while windows reload
fn download(service: &UpdateService, key: ControllerKey, image_id: usize) -> Result<Vec<u8>> {
    let mut image = Vec::with_capacity(IMAGE_SIZE);
    let mut chunk = [0u8; READ_SIZE];
    let deadline = Instant::now() + Duration::from_secs(10);

    while image.len() < IMAGE_SIZE {
        let want = READ_SIZE.min(IMAGE_SIZE - image.len());
        let Some(buf) = chunk.get_mut(..want) else {
            bail!("bad read length {want}");
        };
        let copied = service.image_data_read(key, image_id, image.len() as u64, buf)?;
        if copied == 0 {
            if Instant::now() > deadline {
                bail!("download stalled at {}", image.len());
            }
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        image.extend_from_slice(buf.get(..copied).unwrap_or_default());
    }
    Ok(image)
}

fn drain(events: &mut broadcast::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[test]
fn test_full_session_lifecycle() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;
    let mut events = service.subscribe();
    let key = ControllerKey::new(1, 4);

    let Some(candidate) = service.find_update(&query()) else {
        bail!("2.0.0.0 should be offered to a remote running 1.9.9.9");
    };
    assert_eq!(candidate.version, SoftwareVersion::new(2, 0, 0, 0));
    assert_eq!(candidate.size, IMAGE_SIZE as u64);

    let outcome = service.begin(request(key, candidate.id))?;
    let BeginOutcome::Ready { session_id, .. } = outcome else {
        bail!("expected a ready session, got {outcome:?}");
    };
    assert!(service.is_controller_updating(&key));

    let image = download(&service, key, candidate.id)?;
    assert_eq!(image, payload());

    wait_for("load waiting state", || {
        service.session(&key).map(|s| s.state) == Some(SessionState::LoadWaiting)
    })?;
    assert_eq!(service.counters().rf4ce_session_active_count, 0);
    assert_eq!(service.load_info(key, candidate.id)?, LoadInfo::Now);

    service.end(key, candidate.id, SessionResult::Success)?;
    assert!(!service.is_controller_updating(&key));
    assert_eq!(service.counters(), SessionCounters::default());

    let events = drain(&mut events);
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::DownloadStatus { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![25, 50, 75, 100]);
    assert!(matches!(
        events.first(),
        Some(UpdateEvent::ReadyToDownload { session_id: id, .. }) if *id == session_id
    ));
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::LoadBegin { .. })));
    assert!(matches!(
        events.last(),
        Some(UpdateEvent::LoadEnd {
            result: SessionResult::Success,
            ..
        })
    ));

    service.shutdown()?;
    assert!(!service.is_running());
    Ok(())
}

#[test]
fn test_resume_from_middle_of_image() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;
    let key = ControllerKey::new(1, 5);
    service.begin(request(key, 0))?;

    // A remote that rebooted mid-download asks for bytes far from the windows
    let offset = 7_000u64;
    let mut buf = [0u8; 64];
    let deadline = Instant::now() + Duration::from_secs(5);
    let copied = loop {
        let copied = service.image_data_read(key, 0, offset, &mut buf)?;
        if copied > 0 {
            break copied;
        }
        if Instant::now() > deadline {
            bail!("reload never completed");
        }
        thread::sleep(Duration::from_millis(1));
    };

    assert_eq!(copied, buf.len());
    let expected = payload();
    assert_eq!(Some(buf.as_slice()), expected.get(7_000..7_064));

    service.shutdown()?;
    Ok(())
}

#[test]
fn test_out_of_range_read_is_rejected() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;
    let key = ControllerKey::new(1, 6);
    service.begin(request(key, 0))?;

    let mut buf = [0u8; 32];
    let result = service.image_data_read(key, 0, IMAGE_SIZE as u64 - 8, &mut buf);
    assert!(matches!(result, Err(UpdateError::OffsetOutOfRange { .. })));

    let unknown = service.image_data_read(ControllerKey::new(1, 99), 0, 0, &mut buf);
    assert!(matches!(unknown, Err(UpdateError::SessionNotFound(_))));

    service.shutdown()?;
    Ok(())
}

#[test]
fn test_third_remote_is_busy() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;

    service.begin(request(ControllerKey::new(1, 1), 0))?;
    service.begin(request(ControllerKey::new(1, 2), 0))?;
    let busy = service.begin(request(ControllerKey::new(1, 3), 0));

    let Err(err) = busy else {
        bail!("third session should not start");
    };
    assert!(err.is_retryable());
    assert_eq!(service.image(0).map(|i| i.reader_count), Some(2));

    service.shutdown()?;
    Ok(())
}

#[test]
fn test_session_times_out() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;
    let mut events = service.subscribe();
    let key = ControllerKey::new(1, 7);

    service.begin(request(key, 0).with_timeout(Duration::from_millis(30)))?;
    wait_for("session timeout", || !service.is_controller_updating(&key))?;

    let timed_out = drain(&mut events).into_iter().any(|e| {
        matches!(
            e,
            UpdateEvent::LoadEnd {
                result: SessionResult::ErrorTimeout,
                ..
            }
        )
    });
    assert!(timed_out);
    assert_eq!(service.image(0).map(|i| i.reader_count), Some(0));

    service.shutdown()?;
    Ok(())
}

#[test]
fn test_sessions_resume_after_restart() -> Result<()> {
    let setup = setup()?;
    let state = tempfile::tempdir()?;
    let key = ControllerKey::new(2, 9);

    let session_id = {
        let store = Arc::new(JsonFileStore::new(state.path())?);
        let mut service = UpdateService::init(config(&setup)?, store)?;
        let BeginOutcome::Ready { session_id, .. } = service.begin(request(key, 0))? else {
            bail!("session should start");
        };
        service.shutdown()?;
        session_id
    };

    let store = Arc::new(JsonFileStore::new(state.path())?);
    assert_eq!(store.read_pending_sessions()?.len(), 1);

    let mut service = UpdateService::init(config(&setup)?, store)?;
    wait_for("resumed session", || service.is_controller_updating(&key))?;
    assert_eq!(service.session(&key).map(|s| s.session_id), Some(session_id));

    service.end(key, 0, SessionResult::Success)?;
    service.shutdown()?;

    let store = JsonFileStore::new(state.path())?;
    assert!(store.read_pending_sessions()?.is_empty());
    assert_eq!(store.read_session_id()?, session_id);
    Ok(())
}

#[test]
fn test_external_push_adds_image() -> Result<()> {
    let setup = setup()?;
    let pushed = tempfile::tempdir()?;
    let archive = build_archive(pushed.path(), "xr15_3.0.0.0.tgz", "3.0.0.0", &payload())?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;

    service.process_external_push(&archive, None)?;
    wait_for("pushed image", || service.image(1).is_some())?;
    assert_eq!(
        service.find_update(&query()).map(|c| c.version),
        Some(SoftwareVersion::new(3, 0, 0, 0))
    );

    service.shutdown()?;
    Ok(())
}

#[test]
fn test_push_with_far_id_leaves_service_running() -> Result<()> {
    let setup = setup()?;
    let pushed = tempfile::tempdir()?;
    let archive = build_archive(pushed.path(), "xr15_3.0.0.0.tgz", "3.0.0.0", &payload())?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;

    service.process_external_push(&archive, Some(usize::MAX / 2))?;
    service.process_external_push(&archive, Some(2))?;
    wait_for("pushed image", || service.image(2).is_some())?;
    assert!(service.image(1).is_none());

    let key = ControllerKey::new(1, 1);
    assert!(matches!(service.begin(request(key, 0))?, BeginOutcome::Ready { .. }));
    service.end(key, 0, SessionResult::Success)?;
    service.shutdown()?;
    Ok(())
}

#[test]
fn test_live_configuration_change() -> Result<()> {
    let setup = setup()?;
    let mut service = UpdateService::init(config(&setup)?, Arc::new(MemoryStore::new()))?;

    service.apply_attribute("percent_increment", serde_json::json!(10))?;
    assert_eq!(service.config().percent_increment, 10);

    let err = service.apply_attribute("no_such_key", serde_json::json!(1));
    assert!(matches!(err, Err(UpdateError::ConfigFieldInvalid { .. })));

    service.shutdown()?;
    assert!(matches!(
        service.begin(request(ControllerKey::new(1, 1), 0)),
        Err(UpdateError::ServiceStopped)
    ));
    Ok(())
}

#[test]
fn test_logging_installs_once() {
    rcu_update::logging::try_init("warn");
    assert!(!rcu_update::logging::try_init("debug"));
}

#[test]
fn test_periodic_scan_resumes_waiting_session() -> Result<()> {
    let images = tempfile::tempdir()?;
    let temp = tempfile::tempdir()?;
    let key = ControllerKey::new(3, 2);

    let saved = PendingSession {
        key,
        image_type: ImageType::Firmware,
        controller_type: "XR15-10".to_string(),
        hardware: HardwareVersion::new(2, 3, 1, 0),
        bootloader: SoftwareVersion::new(1, 0, 0, 0),
        software: SoftwareVersion::new(1, 9, 9, 9),
        audio_theme: AudioTheme::INVALID,
        type_z: false,
        session_id: 31,
        image_id: 0,
        download_initiated: true,
        background_download: true,
        manual_poll: false,
        percent_increment: 25,
        load_initiated: false,
        load: rcu_update::LoadPolicy::default(),
    };
    let store = Arc::new(MemoryStore::new());
    store.write_pending_sessions(&[saved])?;

    let config = UpdateConfig::builder()
        .update_dir(images.path())
        .temp_path(temp.path())
        .image_poll_interval(Duration::from_millis(20))
        .build()?;
    let mut service = UpdateService::init(config, store)?;
    thread::sleep(Duration::from_millis(50));
    assert!(!service.is_controller_updating(&key));

    // Renamed into place so a scan never sees a half-written archive
    let staging = tempfile::tempdir()?;
    let archive = build_archive(staging.path(), "late.tgz", "2.0.0.0", &payload())?;
    std::fs::rename(&archive, images.path().join("late.tgz"))?;
    wait_for("session resumed by periodic scan", || service.is_controller_updating(&key))?;
    assert_eq!(service.session(&key).map(|s| s.session_id), Some(31));

    service.shutdown()?;
    Ok(())
}

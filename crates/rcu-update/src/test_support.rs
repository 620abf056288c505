//! Fixtures shared by unit tests

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use rcu_image::{Extractor, HardwareVersion, ImageCatalog, SoftwareVersion, TarGzExtractor, XmlTagReader};
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::config::{UpdateConfig, UpdateConfigBuilder};
use crate::events::{EventSink, UpdateEvent};
use crate::manager::{BeginRequest, SessionManager};
use crate::persist::MemoryStore;
use crate::session::ControllerKey;
use crate::stream::StreamRegistry;

pub(crate) const CONTROLLER_TYPE: &str = "XR15-10";

pub(crate) fn descriptor(version: &str, size: usize) -> String {
    format!(
        "<image><productName>{CONTROLLER_TYPE}</productName><type>firmware</type>\
         <version>{version}</version><bootloaderVersionMin>1.0.0.0</bootloaderVersionMin>\
         <hwVersionMin>2.3.0.0</hwVersionMin><fileName>payload.bin</fileName>\
         <size>{size}</size><crc>0x0BADF00D</crc></image>"
    )
}

pub(crate) fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 253) as u8).collect()
}

pub(crate) fn build_archive(dir: &Path, name: &str, version: &str, size: usize) -> io::Result<PathBuf> {
    let path = dir.join(name);
    let xml = descriptor(version, size);
    let data = payload(size);
    let mut builder = tar::Builder::new(GzEncoder::new(File::create(&path)?, Compression::fast()));

    let mut header = tar::Header::new_gnu();
    header.set_size(xml.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "image.xml", xml.as_bytes())?;

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "payload.bin", data.as_slice())?;

    builder.into_inner()?.finish()?;
    Ok(path)
}

pub(crate) struct Fixture {
    pub manager: SessionManager,
    pub events: broadcast::Receiver<UpdateEvent>,
    pub store: Arc<MemoryStore>,
    pub images_dir: TempDir,
    pub temp_dir: TempDir,
}

impl Fixture {
    pub fn drain_events(&mut self) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Manager over a catalog of firmware images `(version, size)`
pub(crate) fn fixture(
    configure: impl FnOnce(UpdateConfigBuilder) -> UpdateConfigBuilder,
    images: &[(&str, usize)],
    store: Arc<MemoryStore>,
) -> anyhow::Result<Fixture> {
    fixture_with(configure, images, store, Arc::new(TarGzExtractor))
}

pub(crate) fn fixture_with(
    configure: impl FnOnce(UpdateConfigBuilder) -> UpdateConfigBuilder,
    images: &[(&str, usize)],
    store: Arc<MemoryStore>,
    extractor: Arc<dyn Extractor>,
) -> anyhow::Result<Fixture> {
    let images_dir = tempfile::tempdir()?;
    let temp_dir = tempfile::tempdir()?;
    for (index, (version, size)) in images.iter().enumerate() {
        build_archive(images_dir.path(), &format!("{index:02}_fw.tgz"), version, *size)?;
    }

    let config: UpdateConfig = configure(
        UpdateConfig::builder()
            .update_dir(images_dir.path())
            .temp_path(temp_dir.path()),
    )
    .build()?;

    let catalog = ImageCatalog::new(temp_dir.path(), extractor, Arc::new(XmlTagReader));
    let events = EventSink::new();
    let receiver = events.subscribe();
    let mut manager = SessionManager::new(config, catalog, store.clone(), events, StreamRegistry::new());
    manager.scan_images();

    Ok(Fixture {
        manager,
        events: receiver,
        store,
        images_dir,
        temp_dir,
    })
}

pub(crate) fn request(controller_id: u8, image_id: usize) -> BeginRequest {
    BeginRequest::new(
        ControllerKey::new(1, controller_id),
        image_id,
        HardwareVersion::new(2, 3, 1, 0),
        SoftwareVersion::new(1, 0, 0, 0),
        SoftwareVersion::new(1, 9, 9, 9),
    )
}

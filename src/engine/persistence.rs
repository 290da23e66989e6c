//! Queue persistence (spec §4.12, §6.4): one XML file per bundle under
//! `persistence.queue_dir`, rewritten atomically (write to `.tmp`, rename
//! over the original) so a crash mid-write never corrupts the live file.

use std::io::Write as _;
use std::path::PathBuf;

use quick_xml::events::{BytesEnd, BytesStart, Event as XmlEvent};
use quick_xml::Writer;

use crate::engine::QueueEngine;
use crate::error::{Error, PersistenceError, Result};
use crate::types::BundleToken;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct QueuePersistence;

impl QueuePersistence {
    fn path_for(&self, dir: &std::path::Path, bundle: BundleToken) -> PathBuf {
        dir.join(format!("bundle-{bundle}.xml"))
    }

    /// Serializes `bundle`'s file list and writes it out atomically (spec
    /// §4.12, §6.4 layout).
    pub async fn save_bundle(&self, engine: &QueueEngine, bundle: BundleToken) -> Result<()> {
        let bundles = engine.bundles.read().await;
        let b = bundles
            .find_bundle(bundle)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle}")))?;
        let file_tokens: Vec<_> = b.files.iter().copied().collect();
        let local_root = b.path.local_root.clone();
        let priority = b.priority;
        drop(bundles);

        let files = engine.files.read().await;
        let mut writer = Writer::new(Vec::new());
        let mut bundle_tag = BytesStart::new("Bundle");
        bundle_tag.push_attribute(("Version", SCHEMA_VERSION.to_string().as_str()));
        bundle_tag.push_attribute(("Target", local_root.as_str()));
        bundle_tag.push_attribute(("Priority", (priority as i8).to_string().as_str()));
        writer
            .write_event(XmlEvent::Start(bundle_tag))
            .map_err(|e| PersistenceError::Xml(bundle, e.to_string()))?;

        for token in file_tokens {
            let Some(file) = files.find_file(token) else {
                continue;
            };
            let mut file_tag = BytesStart::new("File");
            file_tag.push_attribute(("Target", file.target.as_str()));
            file_tag.push_attribute(("Size", file.size.to_string().as_str()));
            file_tag.push_attribute(("TTH", file.tth.as_str()));
            file_tag.push_attribute(("Priority", (file.priority as i8).to_string().as_str()));
            writer
                .write_event(XmlEvent::Empty(file_tag))
                .map_err(|e| PersistenceError::Xml(bundle, e.to_string()))?;
        }
        drop(files);

        writer
            .write_event(XmlEvent::End(BytesEnd::new("Bundle")))
            .map_err(|e| PersistenceError::Xml(bundle, e.to_string()))?;

        let bytes = writer.into_inner();
        self.write_atomic(&engine.config.persistence.queue_dir, bundle, &bytes).await?;
        Ok(())
    }

    async fn write_atomic(&self, dir: &std::path::Path, bundle: BundleToken, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PersistenceError::Io(bundle, e))?;
        let final_path = self.path_for(dir, bundle);
        let tmp_path = final_path.with_extension("xml.tmp");

        let bytes = bytes.to_vec();
        let tmp_path_clone = tmp_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut f = std::fs::File::create(&tmp_path_clone)?;
            f.write_all(&bytes)?;
            f.sync_all()
        })
        .await
        .map_err(|e| PersistenceError::Io(bundle, std::io::Error::other(e)))?
        .map_err(|e| PersistenceError::Io(bundle, e))?;

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| PersistenceError::Io(bundle, e))?;
        Ok(())
    }

    /// Reads back a bundle file, rejecting anything newer than this build
    /// understands (spec §4.12 schema version check).
    pub async fn load_bundle(&self, dir: &std::path::Path, bundle: BundleToken) -> Result<String> {
        let path = self.path_for(dir, bundle);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PersistenceError::Io(bundle, e))?;
        let version = extract_version(&contents).unwrap_or(0);
        if version > SCHEMA_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version, bundle).into());
        }
        Ok(contents)
    }
}

fn extract_version(xml: &str) -> Option<u32> {
    let marker = "Version=\"";
    let start = xml.find(marker)? + marker.len();
    let end = xml[start..].find('"')? + start;
    xml[start..end].parse().ok()
}

use crate::block::Block;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";

/// Durable state of one collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Block of the last successful run
    #[serde(default)]
    pub block: Option<Block>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl MetadataEntry {
    pub fn record_success(&mut self, block: Option<Block>, at: DateTime<Utc>) {
        if block.is_some() {
            self.block = block;
        }
        self.last_update = Some(at);
        self.last_error = None;
    }

    /// The stored block is deliberately left alone
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

/// Per-collector state consulted and updated by the runner
pub trait MetadataStore {
    /// Missing entries read as the default entry
    fn get(&self, collector_id: &str) -> MetadataEntry;

    fn set(&mut self, collector_id: &str, entry: MetadataEntry);

    /// Persist pending changes
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMetadata {
    entries: BTreeMap<String, MetadataEntry>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &BTreeMap<String, MetadataEntry> {
        &self.entries
    }
}

impl MetadataStore for InMemoryMetadata {
    fn get(&self, collector_id: &str) -> MetadataEntry {
        self.entries.get(collector_id).cloned().unwrap_or_default()
    }

    fn set(&mut self, collector_id: &str, entry: MetadataEntry) {
        self.entries.insert(collector_id.to_string(), entry);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    collectors: BTreeMap<String, MetadataEntry>,
}

/// `metadata.json` inside a runner directory
#[derive(Debug)]
pub struct FileMetadataStore {
    path: PathBuf,
    file: MetadataFile,
    dirty: bool,
}

impl FileMetadataStore {
    pub fn open(runner_dir: &Path) -> Result<Self> {
        let path = runner_dir.join(METADATA_FILE);
        let file = if path.is_file() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            MetadataFile::default()
        };

        Ok(Self {
            path,
            file,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &BTreeMap<String, MetadataEntry> {
        &self.file.collectors
    }
}

impl MetadataStore for FileMetadataStore {
    fn get(&self, collector_id: &str) -> MetadataEntry {
        self.file.collectors.get(collector_id).cloned().unwrap_or_default()
    }

    fn set(&mut self, collector_id: &str, entry: MetadataEntry) {
        self.file.collectors.insert(collector_id.to_string(), entry);
        self.dirty = true;
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_vec_pretty(&self.file)?)?;
        fs::rename(&temp_path, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

use crate::record::{Record, Value};
use crate::{Result, SyncError};
use bincode::{Decode, Encode};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extension of dataset files inside a runner directory
pub const DATASET_EXTENSION: &str = "arr";

const FORMAT_VERSION: u32 = 1;

/// On-disk layout: one vector per column, rows sorted by key
#[derive(Encode, Decode, Default)]
struct ColumnarFile {
    format_version: u32,
    partitions: Vec<String>,
    ids: Vec<String>,
    columns: Vec<Column>,
}

#[derive(Encode, Decode)]
struct Column {
    name: String,
    values: Vec<Value>,
}

impl ColumnarFile {
    /// `records` must already be sorted by key
    fn from_records(records: &[Record]) -> Self {
        let names: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .collect();

        let columns = names
            .into_iter()
            .map(|name| Column {
                name: name.to_string(),
                values: records
                    .iter()
                    .map(|r| r.fields.get(name).cloned().unwrap_or_default())
                    .collect(),
            })
            .collect();

        Self {
            format_version: FORMAT_VERSION,
            partitions: records.iter().map(|r| r.partition.clone()).collect(),
            ids: records.iter().map(|r| r.id.clone()).collect(),
            columns,
        }
    }

    fn into_records(self) -> Result<Vec<Record>> {
        if self.format_version != FORMAT_VERSION {
            return Err(SyncError::Other(format!(
                "unsupported dataset format version {}",
                self.format_version
            )));
        }

        let rows = self.ids.len();
        if self.partitions.len() != rows || self.columns.iter().any(|c| c.values.len() != rows) {
            return Err(SyncError::Other("dataset columns have mismatched lengths".to_string()));
        }

        let mut records: Vec<Record> = self
            .partitions
            .into_iter()
            .zip(self.ids)
            .map(|(partition, id)| Record::new(partition, id))
            .collect();

        for column in self.columns {
            for (record, value) in records.iter_mut().zip(column.values) {
                if !value.is_null() {
                    record.fields.insert(column.name.clone(), value);
                }
            }
        }

        Ok(records)
    }
}

/// Counts reported by a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Keys only present in the new batch
    pub inserted: usize,
    /// Keys present in both, now holding the new record
    pub replaced: usize,
    /// Old keys kept untouched
    pub retained: usize,
    /// Rows in the dataset after the merge
    pub total: usize,
}

impl MergeSummary {
    pub fn updated(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// A single dataset file
#[derive(Debug, Clone)]
pub struct DatasetStore {
    name: String,
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Store for `<dir>/<name>.arr`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(name, dir.join(format!("{}.{}", name, DATASET_EXTENSION)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read every record. A missing file is an empty dataset.
    pub fn read(&self) -> Result<Vec<Record>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&self.path)?;
        let (file, _): (ColumnarFile, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        file.into_records()
    }

    pub fn read_partition(&self, partition: &str) -> Result<Vec<Record>> {
        let mut records = self.read()?;
        records.retain(|r| r.partition == partition);
        Ok(records)
    }

    /// Distinct text values of `column` among the rows of `partition`.
    /// The `id` column is served from the record key.
    pub fn column_values(&self, partition: &str, column: &str) -> Result<HashSet<String>> {
        Ok(self
            .read_partition(partition)?
            .into_iter()
            .filter_map(|r| {
                if column == crate::record::ID_COLUMN {
                    Some(r.id)
                } else {
                    r.fields.get(column).and_then(Value::as_str).map(str::to_string)
                }
            })
            .collect())
    }

    /// Merge `new` into the stored dataset.
    ///
    /// On shared keys the new record replaces the stored one. When
    /// `force_partition_reset` names a partition, the stored rows of that
    /// partition are dropped first. Duplicate keys on either side fail with
    /// [`SyncError::Integrity`] and leave the file untouched.
    pub fn merge(&self, new: Vec<Record>, force_partition_reset: Option<&str>) -> Result<MergeSummary> {
        if new.is_empty() {
            warn!(dataset = %self.name, "Empty batch, not updating file");
            return Ok(MergeSummary::default());
        }

        check_unique(&new, &self.name, "new batch")?;

        if !self.exists() {
            let inserted = new.len();
            self.write(new)?;
            debug!(dataset = %self.name, inserted, "Created dataset file");
            return Ok(MergeSummary {
                inserted,
                total: inserted,
                ..MergeSummary::default()
            });
        }

        let mut rows = self.read()?;
        check_unique(&rows, &self.name, "stored dataset")?;

        if let Some(partition) = force_partition_reset {
            let before = rows.len();
            rows.retain(|r| r.partition != partition);
            debug!(dataset = %self.name, partition, dropped = before - rows.len(), "Reset partition");
        }

        let mut index: FxHashMap<(String, String), usize> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| ((r.partition.clone(), r.id.clone()), i))
            .collect();

        let mut summary = MergeSummary::default();
        for record in new {
            let key = (record.partition.clone(), record.id.clone());
            match index.get(&key) {
                Some(&i) => {
                    rows[i] = record;
                    summary.replaced += 1;
                }
                None => {
                    index.insert(key, rows.len());
                    rows.push(record);
                    summary.inserted += 1;
                }
            }
        }

        summary.total = rows.len();
        summary.retained = summary.total - summary.updated();
        self.write(rows)?;

        debug!(
            dataset = %self.name,
            inserted = summary.inserted,
            replaced = summary.replaced,
            retained = summary.retained,
            "Merged batch"
        );
        Ok(summary)
    }

    /// Replace the file with `records` in canonical form
    fn write(&self, mut records: Vec<Record>) -> Result<()> {
        records.sort_by(|a, b| a.key().cmp(&b.key()));

        let file = ColumnarFile::from_records(&records);
        let bytes = bincode::encode_to_vec(&file, bincode::config::standard())?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension(format!("{}.tmp", DATASET_EXTENSION));
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn check_unique(records: &[Record], dataset: &str, what: &str) -> Result<()> {
    let duplicates: Vec<(&str, &str)> = records.iter().map(Record::key).duplicates().take(5).collect();
    if duplicates.is_empty() {
        return Ok(());
    }

    Err(SyncError::Integrity(format!(
        "{} of {} has duplicate keys: {:?}",
        what, dataset, duplicates
    )))
}

/// Group records by partition, used by the export and by tests
pub fn by_partition(records: Vec<Record>) -> BTreeMap<String, Vec<Record>> {
    records.into_iter().into_group_map_by(|r| r.partition.clone()).into_iter().collect()
}

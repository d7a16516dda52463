use crate::record::{Record, ID_COLUMN};
use crate::record_store::DatasetStore;
use crate::{Result, SyncError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error};

pub type Batch = Vec<Record>;

type Stage = Box<dyn Fn(Batch) -> Option<Batch>>;

/// Ordered chain of batch transforms.
///
/// Every stage must hand back a batch; a stage returning `None` fails the
/// whole collector run.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<(String, Stage)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, name: &str, stage: F)
    where
        F: Fn(Batch) -> Option<Batch> + 'static,
    {
        self.stages.push((name.to_string(), Box::new(stage)));
    }

    pub fn with<F>(mut self, name: &str, stage: F) -> Self
    where
        F: Fn(Batch) -> Option<Batch> + 'static,
    {
        self.push(name, stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }

    pub fn run(&self, mut batch: Batch) -> Result<Batch> {
        for (name, stage) in &self.stages {
            debug!(stage = %name, rows = batch.len(), "Running postprocessor");
            batch = stage(batch).ok_or_else(|| SyncError::Postprocessor(name.clone()))?;
        }
        Ok(batch)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

pub fn rename_columns(renames: BTreeMap<String, String>) -> impl Fn(Batch) -> Option<Batch> {
    move |mut batch| {
        for record in &mut batch {
            for (from, to) in &renames {
                if let Some(value) = record.fields.remove(from) {
                    record.fields.insert(to.clone(), value);
                }
            }
        }
        Some(batch)
    }
}

pub fn drop_columns(columns: Vec<String>) -> impl Fn(Batch) -> Option<Batch> {
    move |mut batch| {
        for record in &mut batch {
            for column in &columns {
                record.fields.remove(column);
            }
        }
        Some(batch)
    }
}

/// Copy a column; `id` reads the record key
pub fn copy_column(from: String, to: String) -> impl Fn(Batch) -> Option<Batch> {
    move |mut batch| {
        for record in &mut batch {
            let value = if from == ID_COLUMN {
                Some(record.id.clone().into())
            } else {
                record.fields.get(&from).cloned()
            };
            if let Some(value) = value {
                record.fields.insert(to.clone(), value);
            }
        }
        Some(batch)
    }
}

/// Rename `prefixFooBar` columns to `fooBar`
pub fn strip_column_prefix(prefix: String) -> impl Fn(Batch) -> Option<Batch> {
    move |mut batch| {
        for record in &mut batch {
            let matching: Vec<String> = record
                .fields
                .keys()
                .filter(|k| k.len() > prefix.len() && k.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            for key in matching {
                if let Some(value) = record.fields.remove(&key) {
                    record.fields.insert(lower_first(&key[prefix.len()..]), value);
                }
            }
        }
        Some(batch)
    }
}

/// Keep only rows whose `column` value is a known `reference_column` value
/// of the same partition in another dataset. An empty reference keeps
/// everything.
pub fn retain_known(column: String, reference: DatasetStore, reference_column: String) -> impl Fn(Batch) -> Option<Batch> {
    move |batch| {
        let mut by_partition: BTreeMap<String, std::collections::HashSet<String>> = BTreeMap::new();
        for record in &batch {
            if !by_partition.contains_key(&record.partition) {
                match reference.column_values(&record.partition, &reference_column) {
                    Ok(known) => {
                        by_partition.insert(record.partition.clone(), known);
                    }
                    Err(e) => {
                        error!(dataset = reference.name(), error = %e, "Cannot read reference dataset");
                        return None;
                    }
                }
            }
        }

        Some(
            batch
                .into_iter()
                .filter(|r| {
                    let known = &by_partition[&r.partition];
                    known.is_empty()
                        || r.get(&column)
                            .and_then(|v| v.as_str())
                            .map(|v| known.contains(v))
                            .unwrap_or(false)
                })
                .collect(),
        )
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Declarative stage used by the catalog
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageSpec {
    Rename(BTreeMap<String, String>),
    Drop(Vec<String>),
    Copy { from: String, to: String },
    StripPrefix(String),
    RetainKnown {
        column: String,
        dataset: String,
        #[serde(default = "default_reference_column")]
        key: String,
    },
}

fn default_reference_column() -> String {
    ID_COLUMN.to_string()
}

impl StageSpec {
    pub fn name(&self) -> String {
        match self {
            StageSpec::Rename(_) => "rename".to_string(),
            StageSpec::Drop(_) => "drop".to_string(),
            StageSpec::Copy { to, .. } => format!("copy_to_{}", to),
            StageSpec::StripPrefix(p) => format!("strip_{}", p),
            StageSpec::RetainKnown { dataset, .. } => format!("retain_known_{}", dataset),
        }
    }

    /// Append this stage; `runner_dir` locates referenced datasets
    pub fn append_to(&self, pipeline: &mut Pipeline, runner_dir: &Path) {
        let name = self.name();
        match self.clone() {
            StageSpec::Rename(map) => pipeline.push(&name, rename_columns(map)),
            StageSpec::Drop(columns) => pipeline.push(&name, drop_columns(columns)),
            StageSpec::Copy { from, to } => pipeline.push(&name, copy_column(from, to)),
            StageSpec::StripPrefix(prefix) => pipeline.push(&name, strip_column_prefix(prefix)),
            StageSpec::RetainKnown { column, dataset, key } => pipeline.push(
                &name,
                retain_known(column, DatasetStore::in_dir(runner_dir, &dataset), key),
            ),
        }
    }
}

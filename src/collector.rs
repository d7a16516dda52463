use crate::block::Block;
use crate::postprocess::Pipeline;
use crate::record::Record;
use crate::record_store::{DatasetStore, MergeSummary};
use crate::source::{DatasetQuery, FetchRequest, RecordSource};
use crate::{Result, SyncError};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// What a collector is scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Checkpointed: bound to one partition and fetched at a block
    Partition(String),
    /// Unscoped: always fetches the full current state
    Global,
}

/// Parameters of one collector run, decided by the runner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    /// Ignore the previous block and reset the partition before merging
    pub force: bool,
    pub block: Option<Block>,
    pub prev_block: Option<Block>,
}

pub trait Collector {
    fn name(&self) -> &str;

    fn runner_name(&self) -> &str;

    fn scope(&self) -> &Scope;

    fn long_name(&self) -> String {
        format!("{}/{}", self.runner_name(), self.name())
    }

    /// Key into the run metadata
    fn collector_id(&self) -> String {
        match self.scope() {
            Scope::Partition(partition) => format!("{}-{}", self.long_name(), partition),
            Scope::Global => self.long_name(),
        }
    }

    fn partition(&self) -> Option<&str> {
        match self.scope() {
            Scope::Partition(partition) => Some(partition),
            Scope::Global => None,
        }
    }

    /// Can be refreshed incrementally
    fn updatable(&self) -> bool {
        false
    }

    /// Cheap precondition check; must not touch the dataset
    fn verify(&self) -> Result<bool> {
        Ok(true)
    }

    fn run(&mut self, request: &RunRequest) -> Result<MergeSummary>;
}

/// Collector of one dataset on one network, refreshed block by block
pub struct NetworkCollector {
    runner: String,
    name: String,
    scope: Scope,
    partition: String,
    query: DatasetQuery,
    source: Arc<dyn RecordSource>,
    store: DatasetStore,
    pipeline: Pipeline,
}

impl NetworkCollector {
    pub fn new(
        runner: &str,
        name: &str,
        partition: &str,
        query: DatasetQuery,
        source: Arc<dyn RecordSource>,
        runner_dir: &Path,
    ) -> Self {
        Self {
            runner: runner.to_string(),
            name: name.to_string(),
            scope: Scope::Partition(partition.to_string()),
            partition: partition.to_string(),
            query,
            source,
            store: DatasetStore::in_dir(runner_dir, name),
            pipeline: Pipeline::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }
}

impl Collector for NetworkCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn runner_name(&self) -> &str {
        &self.runner
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn updatable(&self) -> bool {
        true
    }

    fn verify(&self) -> Result<bool> {
        if !self.source.has_credentials() {
            error!(collector = %self.collector_id(), "Upstream source has no API key");
            return Ok(false);
        }

        self.query.validate().map_err(SyncError::Config)?;
        Ok(true)
    }

    fn run(&mut self, request: &RunRequest) -> Result<MergeSummary> {
        info!(
            collector = %self.collector_id(),
            block = ?request.block.as_ref().map(|b| b.number),
            prev_block = ?request.prev_block.as_ref().map(|b| b.number),
            force = request.force,
            "Running network collector"
        );

        let fetch = FetchRequest {
            query: &self.query,
            partition: &self.partition,
            at_block: request.block.as_ref(),
            changed_since: if request.force { None } else { request.prev_block.as_ref() },
        };
        let records = stamp_partition(self.source.fetch(&fetch)?, &self.partition);
        let batch = self.pipeline.run(records)?;

        let reset = request.force.then_some(self.partition.as_str());
        self.store.merge(batch, reset)
    }
}

/// Collector that re-reads the full upstream state on every run
pub struct SnapshotCollector {
    runner: String,
    name: String,
    label: String,
    scope: Scope,
    query: DatasetQuery,
    source: Arc<dyn RecordSource>,
    store: DatasetStore,
    pipeline: Pipeline,
}

impl SnapshotCollector {
    /// `label` is stored as the partition of every record
    pub fn new(
        runner: &str,
        name: &str,
        label: &str,
        query: DatasetQuery,
        source: Arc<dyn RecordSource>,
        runner_dir: &Path,
    ) -> Self {
        Self {
            runner: runner.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            scope: Scope::Global,
            query,
            source,
            store: DatasetStore::in_dir(runner_dir, name),
            pipeline: Pipeline::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }
}

impl Collector for SnapshotCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn runner_name(&self) -> &str {
        &self.runner
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn verify(&self) -> Result<bool> {
        if !self.source.has_credentials() {
            error!(collector = %self.collector_id(), "Upstream source has no API key");
            return Ok(false);
        }
        self.query.validate().map_err(SyncError::Config)?;
        Ok(true)
    }

    fn run(&mut self, request: &RunRequest) -> Result<MergeSummary> {
        info!(collector = %self.collector_id(), force = request.force, "Running snapshot collector");

        let fetch = FetchRequest {
            query: &self.query,
            partition: &self.label,
            at_block: None,
            changed_since: None,
        };
        let records = stamp_partition(self.source.fetch(&fetch)?, &self.label);
        let batch = self.pipeline.run(records)?;
        // Forcing drops rows that vanished upstream
        self.store.merge(batch, request.force.then_some(self.label.as_str()))
    }
}

fn stamp_partition(mut records: Vec<Record>, partition: &str) -> Vec<Record> {
    for record in &mut records {
        if record.partition != partition {
            record.partition = partition.to_string();
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSource {
        requests: RefCell<Vec<(Option<u64>, Option<u64>)>>,
        records: Vec<Record>,
        keyless: bool,
    }

    impl RecordSource for RecordingSource {
        fn fetch(&self, request: &FetchRequest<'_>) -> std::result::Result<Vec<Record>, SourceError> {
            self.requests.borrow_mut().push((
                request.at_block.map(|b| b.number),
                request.changed_since.map(|b| b.number),
            ));
            Ok(self.records.clone())
        }

        fn has_credentials(&self) -> bool {
            !self.keyless
        }
    }

    fn query() -> DatasetQuery {
        DatasetQuery::new("proposals", &["id", "title"])
    }

    #[test]
    fn test_identity_strings() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn RecordSource> = Arc::new(RecordingSource::default());
        let network = NetworkCollector::new("daostack", "proposals", "mainnet", query(), source.clone(), dir.path());
        assert_eq!(network.long_name(), "daostack/proposals");
        assert_eq!(network.collector_id(), "daostack/proposals-mainnet");
        assert_eq!(network.partition(), Some("mainnet"));

        let snapshot = SnapshotCollector::new("daostack", "prices", "global", query(), source, dir.path());
        assert_eq!(snapshot.collector_id(), "daostack/prices");
        assert_eq!(snapshot.partition(), None);
        assert!(!snapshot.updatable());
    }

    #[test]
    fn test_run_passes_window_and_stamps_partition() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(RecordingSource {
            records: vec![Record::new("", "1").with("title", "t")],
            ..Default::default()
        });
        let mut collector =
            NetworkCollector::new("daostack", "proposals", "mainnet", query(), source.clone(), dir.path());

        let request = RunRequest {
            force: false,
            block: Some(Block::at_unix("0x2", 200, 0)),
            prev_block: Some(Block::at_unix("0x1", 100, 0)),
        };
        let summary = collector.run(&request).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(source.requests.borrow()[0], (Some(200), Some(100)));
        assert_eq!(collector.store().read().unwrap()[0].partition, "mainnet");

        collector.run(&RunRequest { force: true, ..request }).unwrap();
        assert_eq!(source.requests.borrow()[1], (Some(200), None));
    }

    #[test]
    fn test_forced_snapshot_resets_its_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::in_dir(dir.path(), "prices");
        store
            .merge(vec![Record::new("global", "gone"), Record::new("other", "kept")], None)
            .unwrap();

        let source = Arc::new(RecordingSource {
            records: vec![Record::new("", "fresh")],
            ..Default::default()
        });
        let mut collector = SnapshotCollector::new("daostack", "prices", "global", query(), source, dir.path());

        collector.run(&RunRequest::default()).unwrap();
        assert_eq!(store.read_partition("global").unwrap().len(), 2);

        collector.run(&RunRequest { force: true, ..RunRequest::default() }).unwrap();
        let ids: Vec<String> = store.read_partition("global").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["fresh"]);
        assert_eq!(store.read_partition("other").unwrap().len(), 1);
    }

    #[test]
    fn test_verify_without_credentials_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(RecordingSource {
            keyless: true,
            ..Default::default()
        });
        let collector = NetworkCollector::new("daostack", "proposals", "mainnet", query(), source, dir.path());
        assert!(!collector.verify().unwrap());
    }

    #[test]
    fn test_verify_rejects_unbuildable_query() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(RecordingSource::default());
        let bad = DatasetQuery::new("proposals", &["title"]);
        let collector = NetworkCollector::new("daostack", "proposals", "mainnet", bad, source, dir.path());
        assert!(collector.verify().is_err());
    }

    #[test]
    fn test_failing_postprocessor_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(RecordingSource {
            records: vec![Record::new("mainnet", "1")],
            ..Default::default()
        });
        let mut collector = NetworkCollector::new("daostack", "proposals", "mainnet", query(), source, dir.path())
            .with_pipeline(Pipeline::new().with("broken", |_| None));

        let err = collector.run(&RunRequest::default()).unwrap_err();
        assert!(matches!(err, SyncError::Postprocessor(_)));
        assert!(!collector.store().exists());
    }
}

#![allow(dead_code)]

use dwsync::block::Block;
use dwsync::checkpoint::{CheckpointResolver, RetryPolicy};
use dwsync::collector::NetworkCollector;
use dwsync::record::Record;
use dwsync::runner::Runner;
use dwsync::source::{BlockQuery, BlockSource, DatasetQuery, FetchRequest, RecordSource, SourceError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One observed fetch: partition, pinned block, changed-since block
pub type FetchLog = (String, Option<u64>, Option<u64>);

/// Record source answering from per-partition fixtures
#[derive(Default)]
pub struct FakeSource {
    records: Mutex<BTreeMap<String, Vec<Record>>>,
    failing: Mutex<BTreeSet<String>>,
    pub fetches: Mutex<Vec<FetchLog>>,
    pub keyless: bool,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn keyless() -> Arc<Self> {
        Arc::new(Self {
            keyless: true,
            ..Self::default()
        })
    }

    pub fn set(&self, partition: &str, records: Vec<Record>) {
        self.records.lock().unwrap().insert(partition.to_string(), records);
    }

    pub fn fail(&self, partition: &str) {
        self.failing.lock().unwrap().insert(partition.to_string());
    }

    pub fn fetches(&self) -> Vec<FetchLog> {
        self.fetches.lock().unwrap().clone()
    }
}

impl RecordSource for FakeSource {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Vec<Record>, SourceError> {
        self.fetches.lock().unwrap().push((
            request.partition.to_string(),
            request.at_block.map(|b| b.number),
            request.changed_since.map(|b| b.number),
        ));

        if self.failing.lock().unwrap().contains(request.partition) {
            return Err(SourceError::Transport(format!("{} is unreachable", request.partition)));
        }
        Ok(self.records.lock().unwrap().get(request.partition).cloned().unwrap_or_default())
    }

    fn has_credentials(&self) -> bool {
        !self.keyless
    }
}

/// Block source with one fixed answer per partition
#[derive(Default, Clone)]
pub struct FixedBlocks {
    blocks: Arc<Mutex<BTreeMap<String, Block>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FixedBlocks {
    pub fn new(blocks: &[(&str, u64)]) -> Self {
        let fixed = Self::default();
        for (partition, number) in blocks {
            fixed.set(partition, *number);
        }
        fixed
    }

    pub fn set(&self, partition: &str, number: u64) {
        self.blocks
            .lock()
            .unwrap()
            .insert(partition.to_string(), block(number));
    }

    /// Make every block query for `partition` fail at the transport level
    pub fn fail(&self, partition: &str) {
        self.failing.lock().unwrap().insert(partition.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn resolver(&self) -> CheckpointResolver {
        CheckpointResolver::new(Box::new(self.clone()), 250).with_policy(RetryPolicy::immediate())
    }
}

impl BlockSource for FixedBlocks {
    fn query_blocks(&self, partition: &str, _query: &BlockQuery) -> Result<Vec<Block>, SourceError> {
        self.calls.lock().unwrap().push(partition.to_string());
        if self.failing.lock().unwrap().contains(partition) {
            return Err(SourceError::Transport("blocks endpoint is down".to_string()));
        }
        Ok(self.blocks.lock().unwrap().get(partition).cloned().into_iter().collect())
    }
}

pub fn block(number: u64) -> Block {
    Block::at_unix(format!("0x{:x}", number), number, 1_600_000_000 + number as i64)
}

pub fn proposal(partition: &str, id: &str, title: &str) -> Record {
    Record::new(partition, id).with("title", title)
}

pub fn proposals_query() -> DatasetQuery {
    DatasetQuery::new("proposals", &["id", "title"])
}

/// Runner with one `proposals` collector per partition
pub fn proposals_runner(dw: &Path, source: Arc<FakeSource>, partitions: &[&str]) -> Runner {
    let mut runner = Runner::new("daostack", dw);
    let runner_dir = runner.basedir().to_path_buf();
    for partition in partitions {
        runner.add(Box::new(NetworkCollector::new(
            "daostack",
            "proposals",
            partition,
            proposals_query(),
            source.clone(),
            &runner_dir,
        )));
    }
    runner
}

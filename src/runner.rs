use crate::block::Block;
use crate::checkpoint::CheckpointResolver;
use crate::collector::{Collector, RunRequest};
use crate::metadata::MetadataStore;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Selection and behaviour switches for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore stored blocks and reset every partition
    pub force: bool,
    /// Pin blocks to the last one at or before this time
    pub until: Option<DateTime<Utc>>,
    /// Abort on the first collector failure
    pub fail_fast: bool,
    pub skip_verify: bool,
    pub only_updatable: bool,
    /// Restrict network collectors to these partitions (empty = all)
    pub networks: Vec<String>,
    /// Restrict to these collector names or long names (empty = all)
    pub collectors: Vec<String>,
}

/// State shared by every collector execution of a run
pub struct RunContext<'a> {
    pub metadata: &'a mut dyn MetadataStore,
    pub resolver: &'a CheckpointResolver,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub runner: String,
    pub succeeded: Vec<String>,
    /// Collector id and error message
    pub failed: Vec<(String, String)>,
    /// Collectors that did not pass verification
    pub excluded: Vec<String>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.excluded.is_empty()
    }
}

type ResolvedBlocks = BTreeMap<String, std::result::Result<Option<Block>, String>>;

/// All collectors of one platform
pub struct Runner {
    name: String,
    basedir: PathBuf,
    collectors: Vec<Box<dyn Collector>>,
}

impl Runner {
    pub fn new(name: &str, datawarehouse: &Path) -> Self {
        Self {
            name: name.to_string(),
            basedir: Self::runner_dir(datawarehouse, name),
            collectors: Vec::new(),
        }
    }

    /// Directory holding a runner's datasets and metadata
    pub fn runner_dir(datawarehouse: &Path, name: &str) -> PathBuf {
        datawarehouse.join(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn add(&mut self, collector: Box<dyn Collector>) {
        self.collectors.push(collector);
    }

    pub fn with_collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.add(collector);
        self
    }

    pub fn collectors(&self) -> &[Box<dyn Collector>] {
        &self.collectors
    }

    /// Indices of the collectors selected by `options`, in declaration order
    pub fn filter_collectors(&self, options: &RunOptions) -> Vec<usize> {
        self.collectors
            .iter()
            .enumerate()
            .filter(|(_, c)| !options.only_updatable || c.updatable())
            .filter(|(_, c)| match c.partition() {
                Some(partition) => options.networks.is_empty() || options.networks.iter().any(|n| n == partition),
                None => true,
            })
            .filter(|(_, c)| {
                options.collectors.is_empty()
                    || options
                        .collectors
                        .iter()
                        .any(|sel| sel == c.name() || *sel == c.long_name())
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn verify_collectors(&self, selected: Vec<usize>, report: &mut RunReport) -> Vec<usize> {
        let mut verified = Vec::with_capacity(selected.len());
        for i in selected {
            let collector = &self.collectors[i];
            let id = collector.collector_id();
            match collector.verify() {
                Ok(true) => verified.push(i),
                Ok(false) => {
                    warn!(collector = %id, "Verify returned false, excluding collector");
                    eprintln!("[dwsync] Verify returned false for {} (view logs to see why)", id);
                    report.excluded.push(id);
                }
                Err(e) => {
                    warn!(collector = %id, error = %e, "Verification failed, excluding collector");
                    eprintln!("[dwsync] Won't run {}: {}", id, e);
                    report.excluded.push(id);
                }
            }
        }
        verified
    }

    /// One resolution per partition. The lower bound is the most advanced
    /// block stored by any collector of that partition.
    fn resolve_blocks(&self, selected: &[usize], ctx: &RunContext<'_>, options: &RunOptions) -> ResolvedBlocks {
        let mut previous: BTreeMap<String, Option<Block>> = BTreeMap::new();
        for &i in selected {
            let collector = &self.collectors[i];
            if let Some(partition) = collector.partition() {
                let stored = if options.force {
                    None
                } else {
                    ctx.metadata.get(&collector.collector_id()).block
                };
                let slot = previous.entry(partition.to_string()).or_insert(None);
                if stored > *slot {
                    *slot = stored;
                }
            }
        }

        previous
            .into_iter()
            .map(|(partition, prev)| {
                println!("[dwsync] Requesting a block number for {}...", partition);
                let resolved = ctx
                    .resolver
                    .resolve(&partition, prev.as_ref(), options.until)
                    .map_err(|e| e.to_string());
                match &resolved {
                    Ok(Some(block)) => println!("[dwsync] Using block number {} for {}", block, partition),
                    Ok(None) => println!("[dwsync] No block found for {}, using latest data", partition),
                    Err(e) => warn!(partition = %partition, error = %e, "Could not resolve block"),
                }
                (partition, resolved)
            })
            .collect()
    }

    /// Run every selected collector.
    ///
    /// Collector failures are recorded in the metadata and do not stop the
    /// run unless `fail_fast` is set. Metadata is flushed before returning,
    /// also when failing fast.
    pub fn run(&mut self, ctx: &mut RunContext<'_>, options: &RunOptions) -> Result<RunReport> {
        fs::create_dir_all(&self.basedir)?;

        let mut report = RunReport {
            runner: self.name.clone(),
            ..RunReport::default()
        };

        println!("[dwsync] Verifying collectors of {}", self.name);
        let selected = self.filter_collectors(options);
        let verified = if options.skip_verify {
            selected
        } else {
            self.verify_collectors(selected, &mut report)
        };

        if verified.is_empty() {
            return Err(SyncError::NoValidCollectors(self.name.clone()));
        }

        println!("[dwsync] --- Updating {} datawarehouse ---", self.name);
        let blocks = self.resolve_blocks(&verified, ctx, options);

        for i in verified {
            let id = self.collectors[i].collector_id();
            match self.execute(i, ctx, options, &blocks) {
                Ok(()) => report.succeeded.push(id),
                Err(e) => {
                    let mut entry = ctx.metadata.get(&id);
                    entry.record_failure(e.to_string());
                    ctx.metadata.set(&id, entry);

                    if options.fail_fast {
                        ctx.metadata.flush()?;
                        return Err(e);
                    }

                    warn!(collector = %id, error = %e, "Collector failed, continuing");
                    eprintln!("[dwsync] Collector {} failed: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        ctx.metadata.flush()?;
        println!("[dwsync] --- {}'s datawarehouse updated ---", self.name);
        info!(
            runner = %self.name,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            excluded = report.excluded.len(),
            "Runner finished"
        );
        Ok(report)
    }

    fn execute(
        &mut self,
        index: usize,
        ctx: &mut RunContext<'_>,
        options: &RunOptions,
        blocks: &ResolvedBlocks,
    ) -> Result<()> {
        let collector = &mut self.collectors[index];
        let id = collector.collector_id();
        let mut entry = ctx.metadata.get(&id);

        let block = match collector.partition() {
            Some(partition) => {
                let block = match blocks.get(partition) {
                    Some(Ok(block)) => block.clone(),
                    Some(Err(e)) => {
                        return Err(SyncError::Other(format!("cannot resolve block for {}: {}", partition, e)))
                    }
                    None => None,
                };

                let older = block
                    .as_ref()
                    .map(|b| b.is_older_than(entry.block.as_ref()))
                    .unwrap_or(false);
                if older && !options.force {
                    warn!(collector = %id, "Forcing because using an older block");
                    println!("[dwsync] Warning: forcing {} because requesting an older block", id);
                }

                println!("[dwsync] Running collector {} ({})", collector.long_name(), partition);
                let request = RunRequest {
                    force: options.force || older,
                    block: block.clone(),
                    prev_block: if options.force { None } else { entry.block.clone() },
                };
                collector.run(&request)?;
                block
            }
            None => {
                println!("[dwsync] Running collector {}", collector.long_name());
                collector.run(&RunRequest {
                    force: options.force,
                    ..RunRequest::default()
                })?;
                None
            }
        };

        entry.record_success(block, Utc::now());
        ctx.metadata.set(&id, entry);
        Ok(())
    }
}

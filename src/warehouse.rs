//! Datawarehouse-level bookkeeping and the per-run driver.

use crate::checkpoint::CheckpointResolver;
use crate::metadata::FileMetadataStore;
use crate::runner::{RunContext, RunOptions, RunReport, Runner};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

pub const VERSION_FILE: &str = "version.txt";
pub const UPDATE_DATE_FILE: &str = "update_date.txt";

/// Layout version of the datawarehouse written by this build
pub const DW_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn is_good_version(datawarehouse: &Path, version: &str) -> bool {
    let file = match fs::File::open(datawarehouse.join(VERSION_FILE)) {
        Ok(file) => file,
        Err(_) => return false,
    };
    let mut line = String::new();
    match BufReader::new(file).read_line(&mut line) {
        Ok(_) => line.trim() == version,
        Err(_) => false,
    }
}

/// Remove every entry that is not a dotfile. Returns how many were removed.
pub fn wipe(datawarehouse: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(datawarehouse)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Wipe when forced or when the version marker does not match. Returns
/// whether the datawarehouse was wiped.
pub fn prepare(datawarehouse: &Path, version: &str, delete_force: bool) -> Result<bool> {
    fs::create_dir_all(datawarehouse)?;
    if !delete_force && is_good_version(datawarehouse, version) {
        return Ok(false);
    }

    if !delete_force {
        println!("[dwsync] datawarehouse version is not version {}, upgrading", version);
    }
    let removed = wipe(datawarehouse)?;
    info!(removed, delete_force, "Datawarehouse wiped");
    Ok(true)
}

/// Record the data date (the pinned time when given) and the version
pub fn stamp(datawarehouse: &Path, version: &str, data_date: DateTime<Utc>) -> Result<()> {
    fs::write(
        datawarehouse.join(UPDATE_DATE_FILE),
        format!("{}\n", data_date.to_rfc3339_opts(SecondsFormat::Secs, true)),
    )?;
    fs::write(datawarehouse.join(VERSION_FILE), format!("{}\n", version))?;
    Ok(())
}

pub fn read_update_date(datawarehouse: &Path) -> Option<DateTime<Utc>> {
    let text = fs::read_to_string(datawarehouse.join(UPDATE_DATE_FILE)).ok()?;
    DateTime::parse_from_rfc3339(text.trim()).ok().map(|d| d.with_timezone(&Utc))
}

/// One synchronization of a (staged) datawarehouse
pub struct SyncJob<'a> {
    pub resolver: &'a CheckpointResolver,
    pub options: RunOptions,
    pub delete_force: bool,
    pub version: &'a str,
}

impl SyncJob<'_> {
    /// Prepare the directory, build the runners against it and run them in
    /// order. A runner without valid collectors aborts the job.
    pub fn run<F>(&self, datawarehouse: &Path, build_runners: F) -> Result<Vec<RunReport>>
    where
        F: FnOnce(&Path) -> Result<Vec<Runner>>,
    {
        prepare(datawarehouse, self.version, self.delete_force)?;

        let mut reports = Vec::new();
        for mut runner in build_runners(datawarehouse)? {
            let mut metadata = FileMetadataStore::open(runner.basedir())?;
            let mut ctx = RunContext {
                metadata: &mut metadata,
                resolver: self.resolver,
            };
            reports.push(runner.run(&mut ctx, &self.options)?);
        }

        stamp(datawarehouse, self.version, self.options.until.unwrap_or_else(Utc::now))?;
        Ok(reports)
    }
}

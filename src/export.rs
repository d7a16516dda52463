//! Plain-file export of a datawarehouse: every dataset as CSV next to the
//! run metadata and the top-level `*.txt` markers.

use crate::metadata::METADATA_FILE;
use crate::record::{ID_COLUMN, PARTITION_COLUMN};
use crate::record_store::{DatasetStore, DATASET_EXTENSION};
use crate::{Result, SyncError};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExportSummary {
    /// Paths written, relative to the export directory
    pub files: Vec<PathBuf>,
    pub datasets: usize,
    pub rows: usize,
}

/// Write `store` as CSV. Columns are the partition, the id, then every
/// other column in name order; missing cells are empty.
pub fn write_csv(store: &DatasetStore, out: &Path) -> Result<usize> {
    let records = store.read()?;
    let columns: BTreeSet<&str> = records.iter().flat_map(|r| r.fields.keys().map(String::as_str)).collect();

    let mut writer = csv::Writer::from_path(out).map_err(csv_error)?;
    let header = [PARTITION_COLUMN, ID_COLUMN].into_iter().chain(columns.iter().copied());
    writer.write_record(header).map_err(csv_error)?;

    for record in &records {
        let mut row = vec![record.partition.clone(), record.id.clone()];
        row.extend(columns.iter().map(|c| record.get(c).map(|v| v.to_string()).unwrap_or_default()));
        writer.write_record(&row).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(records.len())
}

fn csv_error(err: csv::Error) -> SyncError {
    SyncError::Other(format!("csv: {}", err))
}

/// Export `datawarehouse` into `out_dir`, keeping the runner layout
pub fn export_datawarehouse(datawarehouse: &Path, out_dir: &Path) -> Result<ExportSummary> {
    fs::create_dir_all(out_dir)?;
    let mut summary = ExportSummary::default();

    for entry in sorted_entries(datawarehouse)? {
        let name = entry.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if name.starts_with('.') {
            continue;
        }

        if entry.is_file() && entry.extension().is_some_and(|e| e == "txt") {
            fs::copy(&entry, out_dir.join(&name))?;
            summary.files.push(PathBuf::from(&name));
        } else if entry.is_dir() {
            export_runner(&entry, &out_dir.join(&name), Path::new(&name), &mut summary)?;
        }
    }

    info!(datasets = summary.datasets, rows = summary.rows, out = %out_dir.display(), "Datawarehouse exported");
    Ok(summary)
}

fn export_runner(runner_dir: &Path, out: &Path, relative: &Path, summary: &mut ExportSummary) -> Result<()> {
    fs::create_dir_all(out)?;

    let metadata = runner_dir.join(METADATA_FILE);
    if metadata.is_file() {
        fs::copy(&metadata, out.join(METADATA_FILE))?;
        summary.files.push(relative.join(METADATA_FILE));
    }

    for path in sorted_entries(runner_dir)? {
        if !path.is_file() || !path.extension().is_some_and(|e| e == DATASET_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };

        let file_name = format!("{}.csv", stem);
        summary.rows += write_csv(&DatasetStore::new(stem, &path), &out.join(&file_name))?;
        summary.datasets += 1;
        summary.files.push(relative.join(file_name));
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn test_csv_has_union_of_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::in_dir(dir.path(), "proposals");
        store
            .merge(
                vec![
                    Record::new("mainnet", "1").with("title", "a,b"),
                    Record::new("xdai", "2").with("votes", 3i64),
                ],
                None,
            )
            .unwrap();

        let out = dir.path().join("proposals.csv");
        assert_eq!(write_csv(&store, &out).unwrap(), 2);
        let text = fs::read_to_string(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["network,id,title,votes", "mainnet,1,\"a,b\",", "xdai,2,,3"]);
    }
}

use clap::Parser;
use dwsync::config::SyncConfig;
use dwsync::export::export_datawarehouse;
use dwsync::workspace::ExclusiveWorkspace;
use dwsync::Result;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dw_export")]
#[command(about = "Export a datawarehouse as CSV files, optionally uploading them", long_about = None)]
struct Cli {
    /// Datawarehouse directory (defaults to DWSYNC_DW_PATH or ./datawarehouse)
    #[arg(long, short = 'd')]
    datawarehouse: Option<PathBuf>,

    /// Output directory
    #[arg(long, short = 'o', default_value = "dw_export")]
    out: PathBuf,

    /// Upload the export to the bucket named by DWSYNC_S3_BUCKET
    #[cfg(feature = "s3")]
    #[arg(long)]
    upload: bool,
}

fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let datawarehouse = cli.datawarehouse.unwrap_or(config.datawarehouse);

    // Export from a staged copy so a running sync never publishes underneath us
    let workspace = ExclusiveWorkspace::acquire(&datawarehouse)?;
    let summary = export_datawarehouse(workspace.staged_root(), &cli.out)?;
    drop(workspace);

    println!(
        "[dw_export] Exported {} datasets ({} rows) to {}",
        summary.datasets,
        summary.rows,
        cli.out.display()
    );

    #[cfg(feature = "s3")]
    if cli.upload {
        use dwsync::remote::{S3UploadConfig, S3Uploader};
        let upload = S3UploadConfig::from_env()
            .ok_or_else(|| dwsync::SyncError::Config("DWSYNC_S3_BUCKET is not set".to_string()))?;
        let keys = S3Uploader::new(upload)?.upload_dir(&cli.out)?;
        println!("[dw_export] Uploaded {} objects", keys.len());
    }

    Ok(())
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("[dw_export] {}", e);
        std::process::exit(e.exit_code());
    }
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing::debug;

use bankfeed_import::{
    CancelToken, DedupeConfig, FormatCatalog, ImportConfig, ImportPipeline,
    InMemoryFingerprintStore, Stage, StoredTransaction,
};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let mut snapshot: Option<PathBuf> = None;
    let mut file: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--snapshot" => {
                let value = args
                    .next()
                    .context("--snapshot needs a path to a fingerprint snapshot")?;
                snapshot = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ if file.is_none() => file = Some(PathBuf::from(&arg)),
            other => bail!("unexpected argument: {other}"),
        }
    }
    let Some(file) = file else {
        print_usage();
        bail!("no input file given");
    };

    let catalog = FormatCatalog::builtin()?;
    let config = ImportConfig::default();

    let store = match &snapshot {
        Some(path) => load_snapshot(path, &config.dedupe)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?,
        None => InMemoryFingerprintStore::new(),
    };

    let bytes = std::fs::read(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file.file_name().and_then(|n| n.to_str());

    let pipeline = ImportPipeline::new(&catalog, config);
    let mut progress = |stage: Stage, percent: f32| {
        debug!(%stage, percent, "import progress");
    };
    let result = pipeline.run(
        &bytes,
        filename,
        &store,
        &mut progress,
        &CancelToken::new(),
    )?;

    println!("{}", serde_json::to_string_pretty(&result.summary)?);
    Ok(())
}

fn print_usage() {
    eprintln!("usage: bankfeed [--snapshot fingerprints.json] <export-file>");
}

/// Load previously stored transactions from a JSON snapshot and index their
/// fingerprints for the duplicate detector.
fn load_snapshot(path: &Path, dedupe: &DedupeConfig) -> Result<InMemoryFingerprintStore> {
    let text = std::fs::read_to_string(path)?;
    let items: Vec<StoredTransaction> = serde_json::from_str(&text)?;
    Ok(InMemoryFingerprintStore::from_stored(items, dedupe))
}

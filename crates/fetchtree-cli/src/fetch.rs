use crate::cli::FetchArgs;
use eyre::{bail, Context, Result};
use fetchtree_core::source::SchemeConnector;
use fetchtree_core::{
    Connector, FetchConfig, FetchSummary, Failure, LocalDirDestination, Orchestrator, Progress,
    SourceParams,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Fold command-line overrides into the loaded configuration.
pub fn apply_overrides(mut config: FetchConfig, args: &FetchArgs) -> Result<FetchConfig> {
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size_bytes = chunk_size;
    }
    if let Some(chunk_workers) = args.chunk_workers {
        config.chunk_workers = chunk_workers;
    }
    if let Some(retries) = args.retries {
        config.chunk_retries = retries;
    }
    if let Some(interval) = args.wait_interval {
        config.worker_wait_interval_secs = interval;
    }
    if let Some(tag) = args.entity_tag {
        config.entity_tag = tag;
    }
    config.validate()?;
    Ok(config)
}

/// What the seed path names once the source has been asked.
#[derive(Debug, PartialEq, Eq)]
enum Seed {
    Tree(String),
    File(String),
}

/// A bare local file becomes a file seed under its parent directory.
fn split_local_file(params: SourceParams, seed: String) -> (SourceParams, String) {
    if params.scheme() != "file" {
        return (params, seed);
    }
    let Some(root) = params.root().map(PathBuf::from) else {
        return (params, seed);
    };
    if !root.is_file() {
        return (params, seed);
    }
    let (parent, name) = match (root.parent(), root.file_name()) {
        (Some(parent), Some(name)) if parent.as_os_str().is_empty() => {
            (".".to_string(), name.to_string_lossy().into_owned())
        }
        (Some(parent), Some(name)) => (
            parent.to_string_lossy().into_owned(),
            name.to_string_lossy().into_owned(),
        ),
        _ => return (params, seed),
    };
    (params.with(SourceParams::ROOT, parent), format!("/{name}"))
}

fn classify_seed(connector: &dyn Connector, params: &SourceParams, seed: String) -> Result<Seed> {
    let mut source = connector
        .connect(params)
        .wrap_err("failed to connect to source")?;
    if seed != "/" && source.stat(&seed).is_ok() {
        return Ok(Seed::File(seed));
    }
    Ok(Seed::Tree(seed))
}

pub fn run_fetch(config: FetchConfig, args: &FetchArgs) -> Result<()> {
    let config = apply_overrides(config, args)?;

    let (mut params, seed) = SourceParams::parse(&args.source)?;
    if let Some(timeout) = args.timeout {
        params.insert(SourceParams::TIMEOUT_SECS, timeout.to_string());
    }
    let (params, seed) = split_local_file(params, seed);
    let connector = Arc::new(SchemeConnector);
    let seed = classify_seed(connector.as_ref(), &params, seed)?;

    std::fs::create_dir_all(&args.destination).with_context(|| {
        format!(
            "failed to create destination {}",
            args.destination.display()
        )
    })?;

    let seed_path = match &seed {
        Seed::Tree(path) | Seed::File(path) => path.clone(),
    };
    let destination = Arc::new(
        LocalDirDestination::new(&args.destination)
            .strip_prefix(seed_path)
            .entity_tag(config.entity_tag),
    );

    let mut orchestrator = Orchestrator::new(config, connector)?;
    match seed {
        Seed::Tree(path) => {
            tracing::info!("walking {} from {}", path, args.source);
            orchestrator.load_queue(params, &path, destination);
        }
        Seed::File(path) => {
            tracing::info!("fetching single file {} from {}", path, args.source);
            orchestrator.load_file(params, &path, destination);
        }
    }
    orchestrator.queue_workers()?;

    let progress_bar = if args.progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["-", "\\", "|", "/"]),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!(
            "Fetching {} → {}",
            args.source,
            args.destination.display()
        ));
        Some(pb)
    } else {
        None
    };

    let files = orchestrator.wait_workers_with(|progress: &Progress| {
        if let Some(pb) = &progress_bar {
            pb.set_message(progress_message(progress));
        }
    })?;

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }

    let summary = orchestrator.summarize(&files);
    let failures = orchestrator.failures();
    orchestrator.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, &failures);
    }

    if !summary.is_clean() {
        bail!(
            "{} failure(s) recorded, {} incomplete file(s)",
            summary.failures,
            summary.incomplete_files
        );
    }
    Ok(())
}

fn progress_message(progress: &Progress) -> String {
    format!(
        "{} dirs pending | {} files pending | {} files done | {} failures | {:.0?}",
        progress.queues.walk,
        progress.queues.download,
        progress.queues.result,
        progress.failures,
        progress.elapsed
    )
}

fn print_summary(summary: &FetchSummary, failures: &[Failure]) {
    println!(
        "Fetch complete: {} files, {} in {:.2?}",
        summary.complete_files,
        format_bytes(summary.total_bytes),
        summary.duration
    );
    println!(
        "• Throughput: {}/s | Parts: {}",
        format_bytes(summary.bytes_per_sec() as u64),
        summary.parts
    );
    if summary.incomplete_files > 0 {
        println!("• Incomplete: {} file(s)", summary.incomplete_files);
    }
    if !failures.is_empty() {
        eprintln!("• Failures: {}", failures.len());
        for failure in failures {
            eprintln!("  - {failure}");
        }
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes == 0 {
        return "0 B".to_owned();
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

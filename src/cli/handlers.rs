use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    app::{AppContext, AppFactory, AppPaths, LedgerAccess},
    lock::FileLock,
    web,
};

/// Takes the base dir lock before the ledger is opened for appending.
pub fn handle_ingest(paths: AppPaths, no_progress: bool) -> Result<()> {
    let _lock = FileLock::try_acquire(paths.base())
        .context("another ingest is already running")?;
    let ctx = AppFactory::create_context(paths, LedgerAccess::Append)?;

    let config = ctx.config();
    let timeout = Duration::from_secs(config.pipeline.fetch_timeout_secs);
    let catalog = AppFactory::create_catalog(&config.catalog, timeout)?;
    let credentials = AppFactory::create_credentials(&config.catalog)?;
    let captioner = AppFactory::create_captioner(config)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                log::warn!("second interrupt, exiting now");
                std::process::exit(130);
            }
            log::warn!("interrupted, finishing the current batch (ctrl+c again to abort)");
        })
        .context("failed to set ctrl+c handler")?;
    }

    let progress = (!no_progress).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {pos} captioned [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    });

    let report = ctx.ingest(catalog, credentials, captioner, stop.clone(), progress.clone())?;

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    let stats = &report.stats;
    println!(
        "{} captioned, {} already present, {} failed ({} pages, {} batches, {} dropped)",
        stats.captioned,
        stats.duplicates,
        stats.failed(),
        report.pages,
        stats.batches,
        stats.failed_batches
    );
    for id in &stats.failed_ids {
        log::debug!("not captioned: {id}");
    }

    if let Some(err) = report.catalog_error {
        bail!("catalog walk stopped early: {err}");
    }
    if stop.load(Ordering::SeqCst) {
        println!("stopped early, run again to continue");
    }
    Ok(())
}

pub fn handle_index(ctx: &AppContext) -> Result<()> {
    let rows = ctx.rebuild_index()?;
    println!("indexed {rows} captions");
    Ok(())
}

pub fn handle_search(ctx: &AppContext, query: &str, k: Option<usize>, verbose: bool) -> Result<()> {
    let hits = ctx.search(query, k)?;

    if verbose {
        for hit in &hits {
            println!("{:.3}  {}  {}", hit.score, hit.id, hit.caption);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    }
    Ok(())
}

pub fn handle_image(ctx: &AppContext, id: &str, output: Option<PathBuf>) -> Result<()> {
    let bytes = ctx.image(id)?;
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.png", crate::cache::cache_key(id))));

    std::fs::write(&output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("{} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

pub fn handle_caption(ctx: &AppContext, files: &[PathBuf]) -> Result<()> {
    let captioner = AppFactory::create_captioner(ctx.config())?;
    for (path, caption) in ctx.caption_files(captioner.as_ref(), files)? {
        println!("{}: {caption}", path.display());
    }
    Ok(())
}

pub fn handle_serve(ctx: AppContext) -> Result<()> {
    // load the model before accepting requests
    let indexed = ctx.search_service()?.indexed();
    log::info!("{} records, {indexed} searchable", ctx.ledger().len());

    web::start_server(Arc::new(ctx))
}

mod app;
mod cli;
mod error;

use crate::app::App;
use crate::cli::{CacheAction, Cli, Command, DbAction};
use crate::error::{ErrorKind, Result};
use ahdb_config::Config;
use ahdb_engine::{EngineEvent, SyncOutcome, export_worker, run_job};
use ahdb_store::Scope;
use clap::Parser;
use exn::ResultExt;
use std::process::ExitCode;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let app = App::open(config).await?;
    match cli.command {
        Command::Sync => sync(&app).await,
        Command::Export { scopes } => export(&app, &scopes).await,
        Command::Run => serve(&app).await,
        Command::CheckUpdate => check_update(&app).await,
        Command::Status => {
            let lines = app.status(OffsetDateTime::now_utc()).await;
            if lines.is_empty() {
                println!("No snapshots in {}", app.config.database.path.display());
            }
            for line in lines {
                println!("{line}");
            }
            Ok(())
        },
        Command::Cache { action } => match action {
            CacheAction::Clear => {
                app.cache.clear().await.or_raise(|| ErrorKind::Cache)?;
                println!("Cache cleared");
                Ok(())
            },
            CacheAction::Prune => {
                let removed = app
                    .cache
                    .prune_expired(app.config.cache.expires_in())
                    .await
                    .or_raise(|| ErrorKind::Cache)?;
                println!("Removed {removed} expired cache entries");
                Ok(())
            },
            CacheAction::Stats => {
                let stats = app.cache.stats().await.or_raise(|| ErrorKind::Cache)?;
                println!("{} entries, {} bytes in {}", stats.entries, stats.bytes, app.cache.root().display());
                Ok(())
            },
        },
        Command::Db {
            action: DbAction::Clear,
        } => {
            let removed = app.store.clear().await.or_raise(|| ErrorKind::Database)?;
            println!("Removed {removed} snapshots");
            Ok(())
        },
    }
}

async fn sync(app: &App) -> Result<()> {
    let engine = app.sync_engine()?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    match engine.run(&cancel).await.or_raise(|| ErrorKind::Sync)? {
        SyncOutcome::Completed(report) => {
            println!("Sync: {report}");
            for failure in &report.failures {
                println!("  {}: {}", failure.key, failure.error);
            }
        },
        SyncOutcome::Coalesced => println!("Sync already in progress"),
    }
    Ok(())
}

async fn export(app: &App, scopes: &[String]) -> Result<()> {
    let scopes = scopes
        .iter()
        .map(|s| s.parse::<Scope>().map_err(|e| exn::Exn::from(ErrorKind::Argument(e.to_string()))))
        .collect::<Result<Vec<_>>>()?;
    let pipeline = app.pipeline(&scopes);
    let requested: Vec<Scope> = if scopes.is_empty() {
        pipeline.targets().map(|target| target.scope.clone()).collect()
    } else {
        scopes
    };
    if requested.is_empty() {
        exn::bail!(ErrorKind::Argument("nothing to export; configure export.selection or name scopes".into()));
    }
    let mut failed = 0;
    for scope in requested {
        let job = pipeline.enqueue(scope);
        let event = run_job(&pipeline, &job).await;
        if matches!(event, EngineEvent::ExportFailed { .. }) {
            failed += 1;
        }
        print_event(&event);
    }
    if failed > 0 {
        exn::bail!(ErrorKind::Export);
    }
    Ok(())
}

async fn check_update(app: &App) -> Result<()> {
    let checker = app.update_checker().await?;
    let previous = checker.elapsed(OffsetDateTime::now_utc());
    let status = checker.check().await.or_raise(|| ErrorKind::UpdateCheck)?;
    println!("Running {}: {status} (previous check: {previous})", checker.running());
    Ok(())
}

/// Run the background workers until Ctrl-C.
async fn serve(app: &App) -> Result<()> {
    let cancel = CancellationToken::new();
    let sync = if app.config.remote.enabled {
        Some(app.sync_engine()?)
    } else {
        tracing::info!("Remote mode disabled, not syncing");
        None
    };
    let checker = app.update_checker().await?;
    let pipeline = app.pipeline(&[]);
    let auto_export = app.config.export.auto && pipeline.targets().next().is_some();
    if app.config.export.auto && !auto_export {
        tracing::warn!("Auto-export enabled but export.selection is empty");
    }
    let watcher = app.watcher(&pipeline);
    let (jobs_tx, jobs_rx) = mpsc::channel(16);
    let printer = print_events(app.events.subscribe(), cancel.clone());

    let sync_task = async {
        if let Some(engine) = &sync {
            engine
                .run_periodic(app.config.sync.interval(), app.config.sync.max_backoff(), cancel.clone())
                .await;
        }
    };
    let export_task = async {
        if auto_export {
            tokio::join!(
                watcher.dispatch(&pipeline, app.config.export.debounce(), jobs_tx, cancel.clone()),
                export_worker(&pipeline, Some(&watcher), jobs_rx, app.events.clone(), cancel.clone()),
            );
        }
    };
    let update_task = checker.run_periodic(app.config.update.check_interval(), cancel.clone());

    tracing::info!(
        database = %app.config.database.path.display(),
        sync = sync.is_some(),
        auto_export,
        "Workers started, press Ctrl-C to stop"
    );
    tokio::join!(cancel_on_ctrl_c(cancel.clone()), sync_task, export_task, update_task, printer);
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutting down");
            cancel.cancel();
        },
        () = cancel.cancelled() => {},
    }
}

async fn print_events(mut events: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Event printer lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            () = cancel.cancelled() => break,
        }
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        // Progress is logged by the engine itself.
        EngineEvent::SyncState(_) => {},
        EngineEvent::SyncFinished(report) => println!("Sync: {report}"),
        EngineEvent::SyncFailed(error) => println!("Sync failed: {error}"),
        EngineEvent::ExportWritten { scope, path } => println!("Exported {scope} to {}", path.display()),
        EngineEvent::ExportSkipped { scope, reason } => println!("Skipped export of {scope}: {reason:?}"),
        EngineEvent::ExportFailed { scope, error } => println!("Export of {scope} failed: {error}"),
        EngineEvent::UpdateChecked(status) => println!("Update check: {status}"),
        EngineEvent::UpdateCheckFailed(error) => println!("Update check failed: {error}"),
    }
}

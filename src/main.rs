use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use appwatch::build::CommandBackend;
use appwatch::watcher::{BatchResult, ExtensionEventKind, FsEventSource, WatcherController};
use appwatch::{BuildOutcome, ManifestLoader, Settings};

#[derive(Parser)]
#[command(name = "appwatch")]
#[command(about = "Hot-reload engine for developing apps built from pluggable extensions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Watch the application and rebuild extensions on change
    Dev {
        /// Quiet period in milliseconds before a batch is processed
        #[arg(long)]
        debounce: Option<u64>,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            Settings::init_config_file(force).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            Ok(())
        }
        Commands::Config => {
            let settings = Settings::load().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let rendered = toml::to_string_pretty(&settings)?;
            print!("{rendered}");
            Ok(())
        }
        Commands::Dev { debounce } => {
            let mut settings = Settings::load().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if let Some(debounce_ms) = debounce {
                settings.watch.debounce_ms = debounce_ms;
            }
            appwatch::logging::init_with_config(&settings.logging);
            dev(settings).await
        }
    }
}

/// Run the dev session until ctrl-c or a fatal error.
async fn dev(settings: Settings) -> anyhow::Result<()> {
    let root = settings.resolved_root();
    let build_output_path = settings.resolved_build_output_path();
    let cancel = CancellationToken::new();

    let loader = Arc::new(ManifestLoader::new(
        settings.app_config_file.clone(),
        settings.extension_directories.clone(),
    ));
    let backend = Arc::new(CommandBackend::new(
        build_output_path.clone(),
        cancel.clone(),
    ));
    let source = FsEventSource::new(
        root.clone(),
        settings.app_config_path(),
        build_output_path.clone(),
        settings.watch.debounce_ms,
        settings.watch.channel_capacity,
        cancel.clone(),
    );

    let controller = WatcherController::builder()
        .root(root)
        .loader(loader)
        .backend(backend)
        .source(source)
        .build_output_path(build_output_path)
        .cancel(cancel.clone())
        .build()?;

    let mut results = controller.subscribe();
    let mut ready = controller.ready();
    let session = tokio::spawn(controller.run());

    // Ctrl-c cancels the whole pipeline cooperatively
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    if ready.changed().await.is_ok() {
        if let Some(initial) = ready.borrow().as_ref() {
            report_batch(initial);
        }
    }

    loop {
        match results.recv().await {
            Ok(result) => report_batch(&result),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("dropped {n} batch results");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    session
        .await
        .context("watcher task panicked")?
        .context("dev session failed")
}

/// Print a per-extension summary of one batch result.
fn report_batch(result: &BatchResult) {
    if let Some(error) = &result.error {
        tracing::error!("reload failed: {error}");
        return;
    }

    for event in &result.extension_events {
        let handle = &event.extension.handle;
        match (&event.kind, &event.build_outcome) {
            (ExtensionEventKind::Deleted, _) => tracing::info!("{handle}: removed"),
            (_, Some(BuildOutcome::Ok)) => tracing::info!("{handle}: build succeeded"),
            (_, Some(BuildOutcome::Error { message })) => {
                tracing::error!("{handle}: build failed\n{message}");
            }
            (ExtensionEventKind::Updated, None) => tracing::info!("{handle}: updated"),
            (_, None) => {}
        }
    }
}

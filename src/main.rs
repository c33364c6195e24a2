use anyhow::Context;
use clap::{Parser, Subcommand};
use slsk_transfers::{
    config::Settings,
    transfer::{
        persistence::{self, StoredTransfer, DOWNLOADS_FILE},
        DownloadFilterEngine,
    },
    utils::format_file_size,
};
use std::path::Path;
use tracing::info;

#[derive(Parser)]
#[command(name = "slsk-transfers")]
#[command(about = "Inspect and maintain Soulseek transfer queues")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the persisted transfer list
    List {
        /// Show uploads instead of downloads
        #[arg(long)]
        uploads: bool,
    },
    /// Rewrite a legacy download list in the current format
    Migrate,
    /// Check a virtual path against the configured download filters
    CheckFilter {
        /// Path as shared by the remote user, e.g. `music\album\track.mp3`
        virtual_path: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("slsk_transfers={}", log_level))
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Command::List { uploads } => list(&settings, uploads),
        Command::Migrate => migrate(&settings),
        Command::CheckFilter { virtual_path } => {
            check_filter(&settings, &virtual_path);
            Ok(())
        }
    }
}

fn list(settings: &Settings, uploads: bool) -> anyhow::Result<()> {
    let data_dir = settings.data_dir()?;
    let path = if uploads {
        persistence::upload_list_path(&data_dir)
    } else {
        persistence::download_list_path(&data_dir)
    };

    let transfers = persistence::load_transfers(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if transfers.is_empty() {
        println!("No transfers in {}", path.display());
        return Ok(());
    }

    for transfer in &transfers {
        print_transfer(transfer);
    }
    println!("{} transfers", transfers.len());
    Ok(())
}

fn print_transfer(transfer: &StoredTransfer) {
    let progress = match transfer.current_offset {
        Some(offset) if transfer.size > 0 => format!("{:>5.1}%", offset as f64 * 100.0 / transfer.size as f64),
        _ => "     -".to_string(),
    };

    println!(
        "{:<20} {} {:>10} {:<16} {}",
        transfer.user,
        progress,
        format_file_size(transfer.size),
        transfer.status.as_deref().unwrap_or("-"),
        transfer.virtual_path
    );
}

fn migrate(settings: &Settings) -> anyhow::Result<()> {
    let data_dir = settings.data_dir()?;
    let source = persistence::download_list_path(&data_dir);
    let target = data_dir.join(DOWNLOADS_FILE);

    if source == target {
        println!("Nothing to migrate, {} is current", target.display());
        return Ok(());
    }

    migrate_file(&source, &target)
}

fn migrate_file(source: &Path, target: &Path) -> anyhow::Result<()> {
    let transfers = persistence::load_transfers(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    persistence::save_transfers(target, &transfers)
        .with_context(|| format!("Failed to write {}", target.display()))?;

    info!(
        "Migrated {} transfers from {} to {}",
        transfers.len(),
        source.display(),
        target.display()
    );
    println!("Migrated {} transfers to {}", transfers.len(), target.display());
    Ok(())
}

fn check_filter(settings: &Settings, virtual_path: &str) {
    let filters = DownloadFilterEngine::compile(&settings.transfers.download_filters);

    for (pattern, error) in filters.failed() {
        println!("Invalid filter {}: {}", pattern, error);
    }

    if !settings.transfers.enable_filters {
        println!("Download filters are disabled in the configuration");
    }

    if filters.is_filtered(virtual_path) {
        println!("Filtered: {}", virtual_path);
    } else {
        println!("Allowed: {}", virtual_path);
    }
}

//! unicloud CLI — unified multi-cloud storage
//!
//! Usage:
//!   unicloud-cli status                     Show provider connection status
//!   unicloud-cli connect <provider>         Connect a provider
//!   unicloud-cli disconnect <provider>      Disconnect a provider
//!   unicloud-cli ls                         List files across providers
//!   unicloud-cli search <query>             Search files across providers
//!   unicloud-cli upload <file> [--to X]     Upload (auto-selects by default)
//!   unicloud-cli download <provider> <id>   Download a file
//!   unicloud-cli quota                      Show combined quota
//!   unicloud-cli refresh                    Refresh all quotas

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use unicloud::{AppContext, ProgressFn, UploadPayload, UploadTarget};

#[derive(Parser)]
#[command(
    name = "unicloud-cli",
    about = "unicloud — unified multi-cloud storage",
    version,
    long_about = "Aggregates Google Drive, OneDrive, Azure Blob and Dropbox.\nProvider ids: google, onedrive, azure, dropbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connection status and per-provider quota
    Status,
    /// Connect a provider (uses stored credentials)
    Connect {
        /// Provider id (google, onedrive, azure, dropbox)
        provider: String,
    },
    /// Disconnect a provider and clear its stored credential
    Disconnect {
        /// Provider id
        provider: String,
    },
    /// List files across all connected providers, newest first
    Ls,
    /// Search files across all connected providers
    Search {
        /// Search term (matched against file names)
        query: String,
    },
    /// Upload a file
    Upload {
        /// Local file path
        file: PathBuf,
        /// Target provider id, or "auto" for most free space
        #[arg(long, default_value = "auto")]
        to: String,
    },
    /// Download a file from a provider
    Download {
        /// Provider id
        provider: String,
        /// Provider-scoped file id
        file_id: String,
        /// Local destination (default: file id in current directory)
        dest: Option<PathBuf>,
    },
    /// Show combined quota across connected providers
    Quota,
    /// Refresh quota snapshots from all connected providers
    Refresh,
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Connect every provider that has stored credentials, quietly skipping
/// the ones that do not.
async fn connect_available(ctx: &AppContext) {
    for status in ctx.manager.get_providers_status().await {
        let id = status.id.to_string();
        if let Err(e) = ctx.manager.connect_provider(&id).await {
            tracing::debug!("{} not connected: {}", id, e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let ctx = AppContext::bootstrap()?;
    let init_results = ctx.manager.init().await;

    match cli.command {
        Commands::Status => {
            for (provider, ok) in &init_results {
                if !ok {
                    println!("{:<14} not configured", provider.to_string());
                }
            }
            connect_available(&ctx).await;
            for status in ctx.manager.get_providers_status().await {
                let state = if status.connected { "connected" } else { "disconnected" };
                println!(
                    "{:<14} {:<12} {} used of {}",
                    status.name,
                    state,
                    format_size(status.quota.used),
                    format_size(status.quota.total),
                );
            }
        }
        Commands::Connect { provider } => match ctx.manager.connect_provider(&provider).await {
            Ok(outcome) => println!("{}", outcome.message),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Disconnect { provider } => {
            match ctx.manager.disconnect_provider(&provider).await {
                Ok(()) => println!("{} disconnected", provider),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Ls => {
            connect_available(&ctx).await;
            let files = ctx.manager.get_all_files().await;
            if files.is_empty() {
                println!("No files (are any providers connected?)");
            }
            for file in files {
                println!(
                    "{:<12} {:>10}  {}  {}",
                    file.provider_name,
                    format_size(file.size),
                    file.modified.format("%Y-%m-%d %H:%M"),
                    file.name,
                );
            }
        }
        Commands::Search { query } => {
            connect_available(&ctx).await;
            // Populate the snapshot so cache-side matches contribute too
            ctx.manager.get_all_files().await;
            let results = ctx.manager.search_files(&query).await;
            if results.is_empty() {
                println!("No matches for '{}'", query);
            }
            for file in results {
                println!("{:<12} {}  ({})", file.provider_name, file.name, file.id);
            }
        }
        Commands::Upload { file, to } => {
            connect_available(&ctx).await;
            let target = match UploadTarget::parse(&to) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };

            let payload = UploadPayload::from_path(&file).await?;
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(payload.name.clone());

            let bar_in_cb = bar.clone();
            let progress: ProgressFn = Box::new(move |pct| {
                bar_in_cb.set_position(pct.round() as u64);
            });

            match ctx.manager.upload_file(&payload, target, Some(&progress)).await {
                Ok(outcome) => {
                    bar.finish_and_clear();
                    println!("{} (file id: {})", outcome.message, outcome.file_id);
                }
                Err(e) => {
                    bar.finish_and_clear();
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Download {
            provider,
            file_id,
            dest,
        } => {
            connect_available(&ctx).await;
            let dest = dest.unwrap_or_else(|| PathBuf::from(&file_id));
            match ctx.manager.download_file(&provider, &file_id, &dest).await {
                Ok(outcome) => println!("{}", outcome.message),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Quota => {
            connect_available(&ctx).await;
            let total = ctx.manager.get_total_quota().await;
            println!(
                "Combined: {} used of {} ({:.1}%), {} free",
                format_size(total.used),
                format_size(total.total),
                total.percentage,
                format_size(total.free),
            );
            for status in ctx.manager.get_providers_status().await {
                if status.connected {
                    println!(
                        "  {:<14} {} used of {}",
                        status.name,
                        format_size(status.quota.used),
                        format_size(status.quota.total),
                    );
                }
            }
        }
        Commands::Refresh => {
            connect_available(&ctx).await;
            ctx.manager.refresh_all_quotas().await;
            println!("Quotas refreshed");
        }
    }

    Ok(())
}

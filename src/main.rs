mod cli;
mod crawl;
mod status;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};

// mimalloc keeps memory flat under long-running high-concurrency crawls
// (glibc malloc doesn't release memory back to the OS under this pattern).
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crawld_core::{AppConfig, SinkConfig};
use crawld_queue::QueueStore;

use crate::cli::Cli;
use crate::crawl::run_crawl;

const EXIT_OK: u8 = 0;
const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .thread_stack_size(4 * 1024 * 1024)
        .max_blocking_threads(64)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };

    runtime.block_on(async_main())
}

async fn async_main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using bundled default");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = match toml::from_str(&config_str) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to parse config");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    // Individual overrides (can override the config file, not --config itself).
    if let Ok(endpoint) = std::env::var("CRAWLD_SINK_URL") {
        config.sink = SinkConfig::Http { endpoint };
    } else if let Ok(path) = std::env::var("CRAWLD_SINK_FILE") {
        config.sink = SinkConfig::File { path };
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.general.data_dir.clone());
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(error = %e, %data_dir, "failed to create data directory");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }
    let db_path = std::env::var("CRAWLD_DB_PATH")
        .unwrap_or_else(|_| format!("{data_dir}/queue_{}.db", cli.site));

    if cli.fresh {
        for ext in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{db_path}{ext}"));
        }
    }

    let queue = match QueueStore::open(&db_path).await {
        Ok(q) => q,
        Err(e) => {
            error!(error = %e, %db_path, "failed to open queue store");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if cli.status {
        return match status::print(&queue).await {
            Ok(()) => ExitCode::from(EXIT_OK),
            Err(e) => {
                error!(error = %e, "failed to read queue status");
                ExitCode::from(EXIT_RUNTIME_ERROR)
            }
        };
    }

    let worker_count = cli
        .workers
        .or_else(|| std::env::var("CRAWLD_WORKERS").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(8)
        .clamp(1, 128);
    let max_pages = Some(cli.max_pages.unwrap_or(config.general.max_pages_per_run));

    match run_crawl(config, queue, worker_count, max_pages).await {
        Ok(outcome) if outcome.interrupted => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!(error = %e, "crawl ended with an unrecoverable error");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

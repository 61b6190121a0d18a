use clap::Parser;

#[derive(Parser)]
#[command(name = "crawld", about = "Polite, resumable, priority-aware website crawler")]
pub struct Cli {
    /// Site configuration profile to crawl. Selects `config/<site>.toml` unless
    /// `--config` overrides the path, and owns the queue file `queue_<site>.db`.
    #[arg(long)]
    pub site: String,

    /// Path to the site's config file.
    #[arg(long, default_value = "config/default.toml")]
    pub config: String,

    /// Directory holding queue files, overriding the config's `general.data_dir`.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Worker pool size, overriding the config default.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Soft cap on successful visits this run, overriding the config default.
    #[arg(long)]
    pub max_pages: Option<u64>,

    /// Continue from the persisted queue for this site (the default).
    #[arg(long, conflicts_with = "fresh")]
    pub resume: bool,

    /// Clear the persisted queue for this site and re-seed from config.
    #[arg(long)]
    pub fresh: bool,

    /// Print queue status for this site and exit instead of crawling.
    #[arg(long)]
    pub status: bool,
}

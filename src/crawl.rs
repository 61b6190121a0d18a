use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crawld_core::{
    AppConfig, CrawlError, Document, FetchOutcome, FetchRequest, RetryConfig, SinkConfig,
    SinkOutcome, UpsertAttrs, UrlRecord,
};
use crawld_fetcher::Fetcher;
use crawld_politeness::PolitenessGate;
use crawld_queue::QueueStore;
use crawld_revisit::RevisitPolicy;
use crawld_robots::RobotsCache;
use crawld_scheduler::Scheduler;
use crawld_sink::{FileSink, HttpSink, Sink};

/// How long a worker goes idle before polling the scheduler again when the
/// queue has no unblocked ready record.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Grace period between "stop accepting new claims" and "cancel work still
/// in flight", per the checkpoint/shutdown contract. Not exposed in config:
/// spec.md doesn't name a tunable for it, and a fixed value keeps shutdown
/// behavior predictable across sites.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// How often the checkpoint task logs queue stats while a crawl runs.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Records older than this are presumed abandoned by a prior crawl process
/// and are returned to `pending` at startup.
const STALE_IN_FLIGHT_THRESHOLD: Duration = Duration::from_secs(600);

struct Context {
    queue: Arc<QueueStore>,
    robots: Arc<RobotsCache>,
    politeness: Arc<PolitenessGate>,
    fetcher: Arc<Fetcher>,
    revisit: Arc<RevisitPolicy>,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn Sink>,
    config: Arc<AppConfig>,
    retry: RetryConfig,
    default_politeness_interval: Duration,
    pages_done: AtomicU64,
    max_pages: Option<u64>,
}

/// Outcome of a full run, used to pick the process exit code.
pub struct RunOutcome {
    pub interrupted: bool,
}

pub async fn run_crawl(
    config: AppConfig,
    queue: QueueStore,
    worker_count: usize,
    max_pages: Option<u64>,
) -> Result<RunOutcome> {
    queue.run_migrations().await?;
    let reclaimed = queue
        .reclaim_stale(Utc::now() - chrono::Duration::from_std(STALE_IN_FLIGHT_THRESHOLD)?)
        .await?;
    if reclaimed > 0 {
        info!(reclaimed, "reconciled stale in-flight records from a prior run");
    }

    for seed in &config.seed_urls {
        if let Ok(url) = Url::parse(seed) {
            let host = url.host_str().unwrap_or("").to_lowercase();
            let priority = config.priority_for_path(url.path());
            queue
                .upsert(
                    seed,
                    &host,
                    UpsertAttrs {
                        priority: Some(priority),
                        depth: Some(0),
                        canonical_of: None,
                    },
                )
                .await?;
        } else {
            warn!(%seed, "skipping unparseable seed URL");
        }
    }

    let default_politeness_interval = Duration::from_secs(config.politeness.default_interval_secs);
    let politeness = Arc::new(PolitenessGate::new());
    let client = reqwest::Client::builder()
        .user_agent(config.fetch.user_agent.clone())
        .build()?;
    let robots = Arc::new(RobotsCache::new(
        client,
        config.fetch.user_agent.clone(),
        Duration::from_secs(config.politeness.robots_refresh_interval_secs),
        Arc::clone(&politeness),
        default_politeness_interval,
    ));
    let fetcher = Arc::new(Fetcher::new(
        &config.fetch.user_agent,
        Duration::from_secs(config.fetch.request_timeout_secs),
        config.accepted_content_types.clone(),
        config.fetch.max_body_bytes,
        config.fetch.max_redirects,
    )?);
    let revisit = Arc::new(RevisitPolicy::new(
        Duration::from_secs(config.revisit.min_interval_secs),
        Duration::from_secs(config.revisit.max_interval_secs),
        Duration::from_secs(config.revisit.default_interval_secs),
        config.revisit.increase_factor,
        config.revisit.decrease_factor,
        config.revisit.jitter_pct,
    ));
    let queue = Arc::new(queue);
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&queue)));
    let sink: Arc<dyn Sink> = match &config.sink {
        SinkConfig::Http { endpoint } => Arc::new(HttpSink::new(endpoint.clone())),
        SinkConfig::File { path } => Arc::new(FileSink::open(path).await?),
    };

    let ctx = Arc::new(Context {
        queue: Arc::clone(&queue),
        robots,
        politeness,
        fetcher,
        revisit,
        scheduler,
        sink,
        retry: config.retry.clone(),
        default_politeness_interval,
        config: Arc::new(config),
        pages_done: AtomicU64::new(0),
        max_pages,
    });

    // `stop` tells workers to quit claiming new work; `force` tells them to
    // abandon whatever they're waiting on right now. The grace period sits
    // between the two.
    let (stop_tx, stop_rx) = watch::channel(false);
    let (force_tx, force_rx) = watch::channel(false);
    let (done_tx, _) = broadcast::channel::<()>(1);

    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown_task = tokio::spawn({
        let interrupted = Arc::clone(&interrupted);
        let stop_tx = stop_tx.clone();
        let force_tx = force_tx.clone();
        let mut done_rx = done_tx.subscribe();
        async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    interrupted.store(true, Ordering::SeqCst);
                    info!("shutdown signal received, draining in-flight work");
                    let _ = stop_tx.send(true);
                }
                _ = done_rx.recv() => {
                    let _ = stop_tx.send(true);
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    warn!("grace period elapsed, cancelling in-flight waits");
                    let _ = force_tx.send(true);
                }
                _ = signal::ctrl_c() => {
                    warn!("second interrupt received, cancelling immediately");
                    let _ = force_tx.send(true);
                }
                _ = done_rx.recv() => {}
            }
        }
    });

    let checkpoint_task = tokio::spawn({
        let queue = Arc::clone(&queue);
        let mut stop_rx = stop_rx.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CHECKPOINT_INTERVAL) => {
                        if let Ok(stats) = queue.stats().await {
                            debug!(?stats.by_status, "checkpoint");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }
    });

    info!(worker_count, "starting crawl workers");
    let mut handles = Vec::with_capacity(worker_count);
    for worker_idx in 0..worker_count {
        let ctx = Arc::clone(&ctx);
        let worker_id = format!("worker-{worker_idx}");
        let stop_rx = stop_rx.clone();
        let force_rx = force_rx.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(ctx, worker_id, stop_rx, force_rx).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    let _ = done_tx.send(());
    let _ = checkpoint_task.await;
    let _ = shutdown_task.await;

    Ok(RunOutcome {
        interrupted: interrupted.load(Ordering::SeqCst),
    })
}

async fn worker_loop(
    ctx: Arc<Context>,
    worker_id: String,
    mut stop_rx: watch::Receiver<bool>,
    force_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        if let Some(max) = ctx.max_pages {
            if ctx.pages_done.load(Ordering::Relaxed) >= max {
                break;
            }
        }

        let claimed = tokio::select! {
            result = ctx.scheduler.claim(&worker_id, Utc::now()) => result,
            _ = stop_rx.changed() => break,
        };

        match claimed {
            Ok(Some(record)) => {
                process_record(&ctx, &worker_id, record, force_rx.clone()).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = stop_rx.changed() => break,
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Races `fut` against `force` flipping true; `None` means cancelled.
async fn cancellable<F: std::future::Future>(
    fut: F,
    force: &mut watch::Receiver<bool>,
) -> Option<F::Output> {
    if *force.borrow() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        _ = force.changed() => None,
    }
}

fn cancel_signal(mut rx: watch::Receiver<bool>) -> impl std::future::Future<Output = ()> {
    async move {
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Drops configured query parameters from a discovered link before it's
/// enqueued, so query-only permutations known to be duplicates (tracking
/// params, session ids) collapse onto the same frontier record.
fn strip_denylisted_query_params(mut url: Url, denylist: &[String]) -> Url {
    if denylist.is_empty() || url.query().is_none() {
        return url;
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !denylist.iter().any(|d| d == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        url.set_query(None);
    } else {
        let qs = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(retained)
            .finish();
        url.set_query(Some(&qs));
    }
    url
}

async fn process_record(
    ctx: &Context,
    worker_id: &str,
    record: UrlRecord,
    mut force: watch::Receiver<bool>,
) {
    let host = record.host.clone();

    let Ok(parsed_url) = Url::parse(&record.url) else {
        let _ = ctx
            .queue
            .complete_permanent_failure(&record.url, "invalid_url", false)
            .await;
        ctx.scheduler.release(&host);
        return;
    };

    if !ctx.robots.is_allowed(&host, &path_and_query(&parsed_url)).await {
        debug!(worker_id, url = %record.url, "robots disallowed");
        let _ = ctx
            .queue
            .complete_permanent_failure(&record.url, "robots_disallowed", true)
            .await;
        ctx.scheduler.release(&host);
        return;
    }

    let min_interval = ctx
        .robots
        .crawl_delay(&host)
        .await
        .unwrap_or(ctx.default_politeness_interval);
    let permit = ctx
        .politeness
        .acquire(&host, min_interval, cancel_signal(force.clone()))
        .await;
    let Some(_permit) = permit else {
        let _ = ctx.queue.release_to_pending(&record.url).await;
        ctx.scheduler.release(&host);
        return;
    };
    // From here the politeness gate's own per-host mutex serializes same-host
    // traffic, so the scheduler no longer needs to hold this host exclusive —
    // releasing now lets other workers pick up other ready records for it
    // instead of sitting idle for the rest of this record's fetch/parse/sink.
    ctx.scheduler.release(&host);

    let req = FetchRequest {
        url: record.url.clone(),
        if_none_match: record.etag.clone(),
        if_modified_since: record.last_modified.clone(),
    };
    let fetch_fut = ctx.fetcher.fetch(&req, |h| ctx.config.host_allowed(h));
    let Some(outcome) = cancellable(fetch_fut, &mut force).await else {
        let _ = ctx.queue.release_to_pending(&record.url).await;
        return;
    };

    handle_outcome(ctx, worker_id, &record, outcome).await;
}

async fn handle_outcome(ctx: &Context, worker_id: &str, record: &UrlRecord, outcome: FetchOutcome) {
    match outcome {
        FetchOutcome::NotModified { status, headers, .. } => {
            let next_crawl = ctx.revisit.next_crawl(record, false, Utc::now());
            let etag = headers.get("etag").map(String::as_str).or(record.etag.as_deref());
            let last_modified = headers
                .get("last-modified")
                .map(String::as_str)
                .or(record.last_modified.as_deref());
            let _ = ctx
                .queue
                .complete_success(&record.url, None, status, etag, last_modified, None, next_crawl)
                .await;
            ctx.pages_done.fetch_add(1, Ordering::Relaxed);
        }
        FetchOutcome::Fresh {
            status,
            headers,
            body,
            final_url,
            ..
        } => {
            handle_fresh(ctx, worker_id, record, status, headers, body, final_url).await;
        }
        FetchOutcome::RedirectChainExceeded => {
            let _ = ctx
                .queue
                .complete_permanent_failure(&record.url, "redirect_chain_exceeded", false)
                .await;
        }
        FetchOutcome::RedirectOffAllowlist { host: off_host } => {
            warn!(worker_id, url = %record.url, %off_host, "redirect left allowlist");
            let _ = ctx
                .queue
                .complete_permanent_failure(&record.url, "redirect_off_allowlist", true)
                .await;
        }
        FetchOutcome::TransientFailure { reason, retry_after } => {
            let delay = retry_after.unwrap_or_else(|| backoff_delay(&ctx.retry, record.retry_count));
            let retry_after_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
            let _ = ctx
                .queue
                .complete_transient_failure(&record.url, reason, retry_after_at, ctx.retry.max_retries)
                .await;
        }
        FetchOutcome::PermanentFailure { reason } => {
            let _ = ctx
                .queue
                .complete_permanent_failure(&record.url, reason, false)
                .await;
        }
    }
}

async fn handle_fresh(
    ctx: &Context,
    worker_id: &str,
    record: &UrlRecord,
    status: u16,
    headers: std::collections::HashMap<String, String>,
    body: Vec<u8>,
    final_url: String,
) {
    let parsed = match crawld_parser::parse(&body, &final_url) {
        Ok(p) => p,
        Err(CrawlError::ParseEmpty) => {
            // Counted as a successful visit for scheduling, but nothing goes
            // to the sink and the content hash is left untouched.
            let next_crawl = ctx.revisit.next_crawl(record, false, Utc::now());
            let _ = ctx
                .queue
                .complete_success(
                    &record.url,
                    record.content_hash.as_deref(),
                    status,
                    headers.get("etag").map(String::as_str),
                    headers.get("last-modified").map(String::as_str),
                    None,
                    next_crawl,
                )
                .await;
            ctx.pages_done.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(e) => {
            warn!(worker_id, url = %record.url, error = %e, "parse failed");
            let _ = ctx
                .queue
                .complete_permanent_failure(&record.url, e.failure_tag(), false)
                .await;
            return;
        }
    };

    let content_changed = record.content_hash.as_deref() != Some(parsed.content_hash.as_str());

    let document = Document {
        final_url: final_url.clone(),
        canonical_url: parsed.canonical_url.clone(),
        title: parsed.title.clone(),
        main_text: parsed.main_text.clone(),
        content_hash: parsed.content_hash.clone(),
        fetched_at: Utc::now(),
        metadata: parsed.metadata.clone(),
    };

    let accepted = match ctx.sink.submit(&document).await {
        Ok(SinkOutcome::Accepted) => true,
        Ok(SinkOutcome::Rejected(reason)) => {
            debug!(worker_id, url = %record.url, %reason, "sink rejected");
            false
        }
        Err(e) => {
            warn!(worker_id, url = %record.url, error = %e, "sink submit failed");
            false
        }
    };

    // A rejection never shortens the interval, even if the hash changed.
    let effective_change = content_changed && accepted;
    let next_crawl = ctx.revisit.next_crawl(record, effective_change, Utc::now());
    let canonical_of = (parsed.canonical_url != record.url).then_some(parsed.canonical_url.as_str());
    let _ = ctx
        .queue
        .complete_success(
            &record.url,
            Some(&parsed.content_hash),
            status,
            headers.get("etag").map(String::as_str),
            headers.get("last-modified").map(String::as_str),
            canonical_of,
            next_crawl,
        )
        .await;
    ctx.pages_done.fetch_add(1, Ordering::Relaxed);

    if record.depth >= ctx.config.general.depth_cap {
        return;
    }

    for link in &parsed.links {
        let Ok(link_url) = Url::parse(&link.url) else {
            continue;
        };
        let link_url = strip_denylisted_query_params(link_url, &ctx.config.dedup.query_param_denylist);
        let link_host = link_url.host_str().unwrap_or("").to_lowercase();
        if link_host.is_empty() || !ctx.config.host_allowed(&link_host) {
            continue;
        }
        if !ctx.robots.is_allowed(&link_host, &path_and_query(&link_url)).await {
            continue;
        }
        let priority = ctx.config.priority_for_path(link_url.path());
        let attrs = UpsertAttrs {
            priority: Some(priority),
            depth: Some(record.depth + 1),
            canonical_of: None,
        };
        if let Err(e) = ctx.queue.upsert(link_url.as_str(), &link_host, attrs).await {
            warn!(worker_id, url = %link_url, error = %e, "failed to enqueue discovered link");
        }
    }
}

/// Exponential backoff with full jitter, bounded by `max_backoff`. Used when
/// a transient failure carries no server-provided `Retry-After`.
fn backoff_delay(retry: &RetryConfig, retry_count: u32) -> Duration {
    let base = retry.base_backoff_secs.saturating_mul(1u64 << retry_count.min(16));
    let capped = base.min(retry.max_backoff_secs).max(1);
    let jittered = rand::thread_rng().gen_range(1..=capped);
    Duration::from_secs(jittered)
}

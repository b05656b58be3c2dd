use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ticketsync::cache::MemoryCache;
use ticketsync::config::{Config, apply_rule_definitions, load_rule_definitions};
use ticketsync::driver::Driver;
use ticketsync::feedback::{self, FeedbackWriter};
use ticketsync::matcher::TicketMatcher;
use ticketsync::notify::NotifyHub;
use ticketsync::reconcile::Reconciler;
use ticketsync::store::{self, CalendarStore};
use ticketsync::tickets::MemoryTickets;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    ticketsync::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let calendars = Arc::new(CalendarStore::open(config.journal_path(), notify.clone())?);

    let tickets = Arc::new(match &config.tickets_file {
        Some(path) => MemoryTickets::load_json(path)?,
        None => MemoryTickets::new(),
    });

    if let Some(path) = &config.rules_file {
        let definitions = load_rule_definitions(path)?;
        let written = apply_rule_definitions(&calendars, &definitions).await?;
        info!(defined = definitions.len(), written, "rules loaded from {}", path.display());
    }

    let cache = Arc::new(MemoryCache::new());
    let reconciler = Arc::new(Reconciler::new(
        tickets.clone(),
        TicketMatcher::new(tickets.clone()),
        calendars.clone(),
        cache.clone(),
        config.title_format(),
    ));
    let driver = Arc::new(Driver::new(calendars.clone(), reconciler, config.scheduler()));
    let writer = Arc::new(FeedbackWriter::new(tickets.clone(), calendars.clone(), cache));

    info!("ticketsync started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tickets: {}", tickets.len());
    info!("  interval: {}s, workers: {}", config.interval.as_secs(), config.workers);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grace = driver.config().shutdown_grace;
    let tasks = [
        tokio::spawn(driver.run(shutdown_rx.clone())),
        tokio::spawn(feedback::run_listener(writer, notify.subscribe_edits(), shutdown_rx.clone())),
        tokio::spawn(store::run_compactor(calendars, config.compact_threshold, shutdown_rx)),
    ];

    // Graceful shutdown: stop ticking on SIGTERM/ctrl-c, let running passes drain
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping scheduler");
    let _ = shutdown_tx.send(true);

    // The driver bounds its own drain; this only guards against a stuck task.
    let deadline = grace + Duration::from_secs(5);
    for task in tasks {
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("background task failed: {e}"),
            Err(_) => warn!("background task did not stop in time"),
        }
    }

    info!("ticketsync stopped");
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tiered_limiter::{LimiterConfig, LimiterError, RateLimiter};

const DEMO_KEYS: [&str; 3] = ["route:messages", "route:reactions", "user:42"];
const CALLS_PER_KEY: usize = 12;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = LimiterConfig::load()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting rate limiter demo...");
    info!(
        "Per-key: {} per {}ms | Global: {:?}",
        config.limit,
        config.window_ms,
        config.global()
    );

    let limiter = Arc::new(RateLimiter::new(config)?);
    let background = limiter.spawn_background();

    // Stats reporter
    let reporter = {
        let limiter = Arc::downgrade(&limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => limiter.log_stats(),
                    None => break,
                }
            }
        })
    };

    let callers = DEMO_KEYS.iter().flat_map(|&key| {
        let limiter = limiter.clone();
        (0..CALLS_PER_KEY).map(move |n| {
            let limiter = limiter.clone();
            async move {
                match limiter.acquire_timeout(key, ACQUIRE_TIMEOUT).await {
                    Ok(permit) => {
                        let (remaining, reset) = (permit.remaining, permit.reset);
                        info!(key, n, remaining, reset, "Call admitted")
                    }
                    Err(LimiterError::Timeout { waited_ms }) => {
                        warn!(key, n, waited_ms, "Call dropped")
                    }
                    Err(e) => error!(key, n, "Call failed: {}", e),
                }
            }
        })
    });

    tokio::select! {
        _ = join_all(callers) => info!("All demo calls finished."),
        _ = tokio::signal::ctrl_c() => info!("Interrupted."),
    }

    info!("Shutting down...");
    limiter.shutdown();
    limiter.log_stats();

    reporter.abort();
    for handle in background {
        handle.abort();
    }

    Ok(())
}

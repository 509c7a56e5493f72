//! Background sweeper that expires stale cache entries.

use super::Sweep;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Periodically sweeps a cache, independent of request traffic.
///
/// Owned by the process lifecycle: `start` on init, `stop` on shutdown.
pub struct CacheSweeper {
    cache: Arc<dyn Sweep>,
    period: Duration,
    running: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl CacheSweeper {
    pub fn new(cache: Arc<dyn Sweep>, period: Duration) -> Self {
        Self {
            cache,
            period,
            running: Mutex::new(None),
        }
    }

    /// Start the sweeper background task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        let cache = self.cache.clone();
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        cache.sweep();
                    }
                }
            }
        });

        tracing::info!("Cache sweeper started (every {:?})", period);
        *running = Some((tx, handle));
    }

    /// Stop the sweeper and wait for its task to exit.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some((tx, handle)) = running {
            let _ = tx.send(());
            if let Err(e) = handle.await {
                tracing::error!("Cache sweeper task failed: {}", e);
            }
            tracing::info!("Cache sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        match self.running.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RateCache;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_entries_on_schedule() {
        let cache = Arc::new(RateCache::new(Duration::from_secs(600)));
        cache
            .get(1, "till", || async { Ok::<_, String>(vec![1, 2, 3]) })
            .await
            .unwrap();

        let sweeper = CacheSweeper::new(cache.clone(), Duration::from_secs(900));
        sweeper.start();
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(cache.stats().total_entries, 1);

        tokio::time::sleep(Duration::from_secs(401)).await;
        assert_eq!(cache.stats().total_entries, 0);

        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweeper_leaves_cache_alone() {
        let cache = Arc::new(RateCache::new(Duration::from_secs(1)));
        cache
            .get(1, "till", || async { Ok::<_, String>("rates") })
            .await
            .unwrap();

        let sweeper = CacheSweeper::new(cache.clone(), Duration::from_secs(10));
        sweeper.start();
        sweeper.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.stats().total_entries, 1);
    }
}

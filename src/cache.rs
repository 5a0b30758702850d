use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{GatewayError, GatewayResult};
use crate::{log_info, log_warn};

/// Source of "now"; injected so freshness can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Produces a fresh list for a cache.
pub type Loader<T> = Box<dyn Fn() -> BoxFuture<'static, GatewayResult<Vec<T>>> + Send + Sync>;

/// One refresh result; replaced whole, never edited.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub data: Arc<Vec<T>>,
    pub last_updated: DateTime<Utc>,
    /// Order in which the producing refresh started.
    generation: u64,
}

/// A list of records plus the time it was last refreshed
pub struct TimedCache<T> {
    name: &'static str,
    validity: TimeDelta,
    clock: Arc<dyn Clock>,
    loader: Loader<T>,
    snapshot: RwLock<Option<Arc<Snapshot<T>>>>,
    started_refreshes: AtomicU64,
}

impl<T: Send + Sync + 'static> TimedCache<T> {
    pub fn new(name: &'static str, validity: Duration, clock: Arc<dyn Clock>, loader: Loader<T>) -> Self {
        Self {
            name,
            validity: TimeDelta::from_std(validity).unwrap_or(TimeDelta::MAX),
            clock,
            loader,
            snapshot: RwLock::new(None),
            started_refreshes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn current(&self) -> Option<Arc<Snapshot<T>>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest data, fresh or not.
    pub fn get(&self) -> Option<Arc<Vec<T>>> {
        self.current().map(|s| Arc::clone(&s.data))
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.current().map(|s| s.last_updated)
    }

    /// Data present and younger than the validity window.
    pub fn is_valid(&self) -> bool {
        self.current()
            .map(|s| self.is_fresh(&s))
            .unwrap_or(false)
    }

    fn is_fresh(&self, snapshot: &Snapshot<T>) -> bool {
        self.clock.now() - snapshot.last_updated < self.validity
    }

    /// Fetches outside the lock, then swaps the snapshot in one step.
    /// A failed fetch leaves the previous snapshot untouched, and so does a
    /// fetch that started before the one already installed.
    pub async fn refresh(&self) -> GatewayResult<()> {
        let generation = self.started_refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let data = (self.loader)().await?;
        let snapshot = Arc::new(Snapshot {
            data: Arc::new(data),
            last_updated: self.clock.now(),
            generation,
        });

        let count = snapshot.data.len();
        let at = snapshot.last_updated;
        {
            let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|current| current.generation > generation) {
                log_info!("{} cache: discarding superseded refresh ({} records)", self.name, count);
                return Ok(());
            }
            *slot = Some(snapshot);
        }
        log_info!("{} cache updated at {} ({} records)", self.name, at, count);
        Ok(())
    }

    /// Read-through: fresh data, else a synchronous refresh, else stale data.
    /// Errors only when nothing was ever captured.
    pub async fn read(&self) -> GatewayResult<Arc<Vec<T>>> {
        if let Some(snapshot) = self.current() {
            if self.is_fresh(&snapshot) {
                log_info!("Serving {} from cache", self.name);
                return Ok(Arc::clone(&snapshot.data));
            }
        }

        match self.refresh().await {
            Ok(()) => self.get().ok_or(GatewayError::CacheEmpty(self.name)),
            Err(e) => match self.get() {
                Some(stale) => {
                    log_warn!("Serving stale {} after refresh failure: {}", self.name, e);
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }
}

/// Refreshes once immediately, then every `period`, regardless of freshness.
pub fn spawn_refresh_loop<T>(cache: Arc<TimedCache<T>>, period: Duration) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = cache.refresh().await {
                log_warn!("{} cache update error: {}", cache.name(), e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Loader replaying scripted results; counts invocations.
    fn scripted(results: Vec<GatewayResult<Vec<u32>>>) -> (Loader<u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(Mutex::new(results.into_iter()));
        let counter = Arc::clone(&calls);
        let loader: Loader<u32> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = queue
                .lock()
                .unwrap()
                .next()
                .unwrap_or_else(|| Err(GatewayError::Provider("exhausted".into())));
            async move { next }.boxed()
        });
        (loader, calls)
    }

    fn cache_with(clock: &Arc<ManualClock>, results: Vec<GatewayResult<Vec<u32>>>) -> (TimedCache<u32>, Arc<AtomicUsize>) {
        let (loader, calls) = scripted(results);
        let clock: Arc<dyn Clock> = clock.clone();
        (
            TimedCache::new("test", Duration::from_secs(15 * 60), clock, loader),
            calls,
        )
    }

    #[tokio::test]
    async fn empty_cache_is_invalid() {
        let clock = Arc::new(ManualClock::default());
        let (cache, _) = cache_with(&clock, vec![]);
        assert!(!cache.is_valid());
        assert!(cache.get().is_none());
        assert!(cache.last_updated().is_none());
    }

    #[tokio::test]
    async fn validity_window_is_exclusive() {
        let clock = Arc::new(ManualClock::default());
        let (cache, _) = cache_with(&clock, vec![Ok(vec![1])]);
        cache.refresh().await.unwrap();

        clock.advance(TimeDelta::minutes(15) - TimeDelta::seconds(1));
        assert!(cache.is_valid());
        clock.advance(TimeDelta::seconds(1));
        assert!(!cache.is_valid());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let clock = Arc::new(ManualClock::default());
        let (cache, _) = cache_with(
            &clock,
            vec![Ok(vec![1, 2]), Err(GatewayError::Provider("down".into()))],
        );
        cache.refresh().await.unwrap();
        let stamped = cache.last_updated();

        assert!(cache.refresh().await.is_err());
        assert_eq!(*cache.get().unwrap(), vec![1, 2]);
        assert_eq!(cache.last_updated(), stamped);
    }

    #[tokio::test]
    async fn read_serves_fresh_data_without_refetching() {
        let clock = Arc::new(ManualClock::default());
        let (cache, calls) = cache_with(&clock, vec![Ok(vec![7])]);

        assert_eq!(*cache.read().await.unwrap(), vec![7]);
        clock.advance(TimeDelta::minutes(10));
        assert_eq!(*cache.read().await.unwrap(), vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_falls_back_to_stale_data_when_refresh_fails() {
        let clock = Arc::new(ManualClock::default());
        let (cache, calls) = cache_with(
            &clock,
            vec![Ok(vec![3]), Err(GatewayError::Provider("timeout".into()))],
        );
        cache.read().await.unwrap();

        clock.advance(TimeDelta::minutes(20));
        assert_eq!(*cache.read().await.unwrap(), vec![3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_surfaces_error_when_nothing_was_ever_captured() {
        let clock = Arc::new(ManualClock::default());
        let (cache, _) = cache_with(&clock, vec![Err(GatewayError::Provider("down".into()))]);
        assert!(matches!(cache.read().await, Err(GatewayError::Provider(_))));
    }

    #[tokio::test]
    async fn stale_read_refreshes_when_provider_recovers() {
        let clock = Arc::new(ManualClock::default());
        let (cache, _) = cache_with(&clock, vec![Ok(vec![1]), Ok(vec![2])]);
        cache.read().await.unwrap();
        clock.advance(TimeDelta::hours(1));
        assert_eq!(*cache.read().await.unwrap(), vec![2]);
        assert!(cache.is_valid());
    }

    #[tokio::test]
    async fn slow_earlier_refresh_does_not_overwrite_newer_data() {
        let (release_slow, slow) = tokio::sync::oneshot::channel::<Vec<u32>>();
        // popped from the back: the slow fetch is handed out first
        let queue = Mutex::new(vec![
            async { Ok::<_, GatewayError>(vec![2]) }.boxed(),
            async move { Ok(slow.await.unwrap()) }.boxed(),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader: Loader<u32> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            queue.lock().unwrap().pop().unwrap()
        });
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(TimedCache::new("race", Duration::from_secs(900), clock, loader));

        let background = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.refresh().await }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        cache.refresh().await.unwrap();
        release_slow.send(vec![1]).unwrap();
        background.await.unwrap().unwrap();

        assert_eq!(*cache.get().unwrap(), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_mixed_generations() {
        let generation = Arc::new(AtomicUsize::new(0));
        let source = Arc::clone(&generation);
        let loader: Loader<usize> = Box::new(move || {
            let gen = source.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut batch = Vec::new();
                for _ in 0..64 {
                    batch.push(gen);
                    tokio::task::yield_now().await;
                }
                Ok::<_, GatewayError>(batch)
            }
            .boxed()
        });
        let cache = Arc::new(TimedCache::new(
            "generations",
            Duration::from_secs(900),
            Arc::new(SystemClock),
            loader,
        ));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        cache.refresh().await.unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        if let Some(data) = cache.get() {
                            assert_eq!(data.len(), 64);
                            assert!(data.iter().all(|g| *g == data[0]));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in writers.into_iter().chain(readers) {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_runs_at_start_and_every_period() {
        let (loader, calls) = scripted(vec![Ok(vec![1]), Ok(vec![2]), Ok(vec![3])]);
        let cache = Arc::new(TimedCache::new(
            "loop",
            Duration::from_secs(900),
            Arc::new(SystemClock),
            loader,
        ));

        let handle = spawn_refresh_loop(Arc::clone(&cache), Duration::from_secs(900));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*cache.get().unwrap(), vec![2]);
        handle.abort();
    }
}

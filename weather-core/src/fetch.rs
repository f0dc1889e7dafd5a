//! The fetch pipeline for one weather request:
//!
//! `canonicalize → cache → rate limiter → provider (with retries) → cache`.
//!
//! Cache hits never touch the rate limiter or the network. The limiter is
//! consulted once per cache miss; retries happen inside the admitted call.
//! Cache outages are logged and degrade to a live fetch. Cache reads and
//! writes on the fetch path run on the blocking pool, since the SQLite store
//! does synchronous disk I/O.

use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{self, CacheStore, MemoryCacheStore, SqliteCacheStore},
    config::Config,
    error::{CacheError, FetchError},
    model::{CanonicalQuery, CurrentWeather, ForecastData, Location, Units, WeatherPayload, WeatherQuery},
    provider::{WeatherProvider, provider_from_config},
    rate_limit::RateLimiter,
    retry::{self, RetryPolicy},
};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// TTL written with every successful fetch.
    pub cache_ttl: Duration,
    /// Bound on limiter wait plus every provider attempt.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache.ttl(),
            request_timeout: config.fetch.request_timeout(),
            retry: config.fetch.retry_policy(),
            sweep_interval: config.cache.sweep_interval(),
        }
    }
}

/// Answers weather requests for the whole application. Cheap to clone; all
/// clones share one cache, one rate limiter and one provider.
#[derive(Debug, Clone)]
pub struct WeatherFetcher {
    provider: Arc<dyn WeatherProvider>,
    cache: Arc<dyn CacheStore>,
    limiter: Arc<RateLimiter>,
    settings: FetchSettings,
}

impl WeatherFetcher {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        cache: Arc<dyn CacheStore>,
        limiter: Arc<RateLimiter>,
        settings: FetchSettings,
    ) -> Self {
        Self { provider, cache, limiter, settings }
    }

    /// Wire up the OpenWeatherMap provider, the on-disk cache and a limiter from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let provider = provider_from_config(config)?;
        let limiter =
            Arc::new(RateLimiter::new(config.rate_limit.capacity, config.rate_limit.window()));

        Ok(Self::new(provider, open_cache(config), limiter, FetchSettings::from_config(config)))
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Cached payload if fresh, otherwise a rate-limited, retried provider call.
    pub async fn fetch(&self, query: &WeatherQuery) -> Result<WeatherPayload, FetchError> {
        let query = query.canonicalize()?;

        if let Some(payload) = self.cached(&query).await {
            return Ok(payload);
        }

        self.fetch_live(&query).await
    }

    /// Skip the cache: drop any entry for `query` and go to the provider.
    pub async fn refresh(&self, query: &WeatherQuery) -> Result<WeatherPayload, FetchError> {
        let query = query.canonicalize()?;
        self.forget(query.key()).await;
        self.fetch_live(&query).await
    }

    /// Current conditions and forecast for one location, fetched concurrently.
    pub async fn fetch_full(
        &self,
        location: Location,
        units: Units,
    ) -> Result<(CurrentWeather, ForecastData), FetchError> {
        let current = WeatherQuery::current(location.clone(), units);
        let forecast = WeatherQuery::forecast(location, units);

        let (current, forecast) = tokio::try_join!(self.fetch(&current), self.fetch(&forecast))?;

        let current = current.into_current().ok_or_else(|| {
            FetchError::MalformedResponse("expected current weather payload".into())
        })?;
        let forecast = forecast
            .into_forecast()
            .ok_or_else(|| FetchError::MalformedResponse("expected forecast payload".into()))?;

        Ok((current, forecast))
    }

    /// Drop the cached entry for `query`, so the next fetch goes to the provider.
    pub fn invalidate(&self, query: &WeatherQuery) -> Result<(), FetchError> {
        let query = query.canonicalize()?;
        self.invalidate_key(query.key());
        Ok(())
    }

    /// Drop a cache entry by its raw key (see [`CanonicalQuery::key`]).
    ///
    /// Runs on the calling thread: a single-row delete.
    pub fn invalidate_key(&self, key: &str) {
        log_invalidation(key, self.cache.invalidate(key));
    }

    /// Run `fetch` on the runtime and hand back a handle to await the result.
    ///
    /// Dropping the handle only suppresses delivery: the provider call still
    /// completes and populates the cache.
    pub fn spawn_fetch(&self, query: WeatherQuery) -> FetchHandle {
        self.spawn(query, false)
    }

    /// [`spawn_fetch`](Self::spawn_fetch), but bypassing any cached entry like [`refresh`](Self::refresh).
    pub fn spawn_refresh(&self, query: WeatherQuery) -> FetchHandle {
        self.spawn(query, true)
    }

    fn spawn(&self, query: WeatherQuery, refresh: bool) -> FetchHandle {
        let (tx, rx) = oneshot::channel();
        let fetcher = self.clone();

        tokio::spawn(async move {
            let result = if refresh {
                fetcher.refresh(&query).await
            } else {
                fetcher.fetch(&query).await
            };
            if tx.send(result).is_err() {
                tracing::debug!(?query, "Requester went away, dropping fetch result");
            }
        });

        FetchHandle { rx }
    }

    /// Start the periodic purge of expired cache entries.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        cache::spawn_sweeper(Arc::clone(&self.cache), self.settings.sweep_interval, shutdown)
    }

    /// Run a cache operation on the blocking pool.
    async fn with_cache<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CacheStore) -> Result<T, CacheError> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || op(cache.as_ref()))
            .await
            .unwrap_or_else(|e| Err(CacheError::Unavailable(format!("cache task failed: {e}"))))
    }

    async fn cached(&self, query: &CanonicalQuery) -> Option<WeatherPayload> {
        let key = query.key();
        let owned = key.to_owned();
        let raw = match self.with_cache(move |cache| cache.get(&owned)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, "{e}; fetching live");
                return None;
            }
        };

        match serde_json::from_str::<WeatherPayload>(&raw) {
            Ok(payload) if payload.kind() == query.kind() => {
                tracing::debug!(key, "Cache hit");
                Some(payload)
            }
            Ok(_) => {
                tracing::warn!(key, "Cached payload has the wrong kind, discarding");
                self.forget(key).await;
                None
            }
            Err(e) => {
                tracing::warn!(key, "Unreadable cache entry ({e}), discarding");
                self.forget(key).await;
                None
            }
        }
    }

    async fn fetch_live(&self, query: &CanonicalQuery) -> Result<WeatherPayload, FetchError> {
        let deadline = retry::deadline_after(self.settings.request_timeout);
        self.limiter.acquire(self.settings.request_timeout).await?;

        tracing::info!(
            key = query.key(),
            provider = self.provider.name(),
            "Fetching weather from provider"
        );

        let provider = &self.provider;
        let payload =
            self.settings.retry.run(deadline, move |_| provider.get_weather(query)).await?;

        if payload.kind() != query.kind() {
            return Err(FetchError::MalformedResponse(format!(
                "asked for {} weather, provider returned {}",
                query.kind().as_str(),
                payload.kind().as_str()
            )));
        }

        self.store(query.key(), &payload).await;
        Ok(payload)
    }

    async fn store(&self, key: &str, payload: &WeatherPayload) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key, "Failed to serialize payload for the cache: {e}");
                return;
            }
        };

        let owned = key.to_owned();
        let ttl = self.settings.cache_ttl;
        if let Err(e) = self.with_cache(move |cache| cache.put(&owned, &json, ttl)).await {
            tracing::warn!(key, "Cache write failed: {e}");
        }
    }

    async fn forget(&self, key: &str) {
        let owned = key.to_owned();
        log_invalidation(key, self.with_cache(move |cache| cache.invalidate(&owned)).await);
    }
}

fn log_invalidation(key: &str, outcome: Result<(), CacheError>) {
    if let Err(e) = outcome {
        tracing::warn!(key, "Cache invalidation failed: {e}");
    }
}

/// Open the SQLite cache, falling back to memory so an unusable disk never blocks fetching.
fn open_cache(config: &Config) -> Arc<dyn CacheStore> {
    let opened = config
        .cache_db_path()
        .map_err(|e| CacheError::Unavailable(e.to_string()))
        .and_then(|path| SqliteCacheStore::open(&path).map(|store| (store, path)));

    match opened {
        Ok((store, path)) => {
            tracing::debug!("Using weather cache at {}", path.display());
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!("{e}; using an in-memory cache for this session");
            Arc::new(MemoryCacheStore::new())
        }
    }
}

/// Pending result of [`WeatherFetcher::spawn_fetch`] or [`WeatherFetcher::spawn_refresh`].
#[derive(Debug)]
pub struct FetchHandle {
    rx: oneshot::Receiver<Result<WeatherPayload, FetchError>>,
}

impl FetchHandle {
    pub async fn wait(self) -> Result<WeatherPayload, FetchError> {
        self.rx.await.unwrap_or(Err(FetchError::Interrupted))
    }

    /// Stop waiting. The underlying fetch keeps running and may still fill the cache.
    pub fn cancel(mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let mut cfg = Config::default();
        cfg.cache.ttl_secs = 42;
        cfg.fetch.request_timeout_secs = 20;

        let settings = FetchSettings::from_config(&cfg);
        assert_eq!(settings.cache_ttl, Duration::from_secs(42));
        assert_eq!(settings.request_timeout, Duration::from_secs(20));
        assert!(settings.retry.attempt_timeout < settings.request_timeout);
    }

    #[test]
    fn from_config_without_key_fails_with_hint() {
        let mut cfg = Config::default();
        cfg.provider.api_key = None;
        if cfg.is_api_key_configured() {
            // OWM_API_KEY is set in this environment; nothing to check.
            return;
        }

        let err = WeatherFetcher::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("weather configure"));
    }

    #[test]
    fn open_cache_falls_back_to_memory() {
        // The database's parent "directory" is a regular file.
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut cfg = Config::default();
        cfg.cache.db_path = Some(file.path().join("weather_cache.db"));

        let store = open_cache(&cfg);
        store.put("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }
}

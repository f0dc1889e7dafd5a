//! Core library for the `weather` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Shared domain models (queries, current weather, forecasts)
//! - The OpenWeatherMap provider behind the [`WeatherProvider`] trait
//! - The resilient fetch pipeline: TTL cache, token-bucket rate limiter and
//!   retry with exponential backoff, composed by [`WeatherFetcher`]
//!
//! It is used by `weather-cli`, but can also be reused by other binaries or services.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod provider;
pub mod rate_limit;
pub mod retry;

pub use cache::{CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ProviderConfig};
pub use error::{CacheError, FetchError};
pub use fetch::{FetchHandle, FetchSettings, WeatherFetcher};
pub use model::{
    CanonicalQuery, CurrentWeather, DailyForecast, ForecastData, GeocodedCity, Location,
    ReportKind, Units, WeatherPayload, WeatherQuery,
};
pub use provider::{WeatherProvider, provider_from_config};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;

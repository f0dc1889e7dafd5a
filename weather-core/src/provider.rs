use crate::{
    CanonicalQuery, Config, WeatherPayload, error::FetchError,
    provider::openweather::OpenWeatherProvider,
};
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};

pub mod openweather;

/// One upstream weather service: turn a canonical query into a parsed payload.
///
/// Implementations perform exactly one call per invocation; retrying, rate
/// limiting and caching are the fetcher's job.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn get_weather(&self, query: &CanonicalQuery) -> Result<WeatherPayload, FetchError>;
}

/// Construct the OpenWeatherMap provider from config (the `OWM_API_KEY`
/// environment variable takes precedence over the stored key).
pub fn provider_from_config(config: &Config) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    build_provider(config, config.api_key())
}

fn build_provider(
    config: &Config,
    api_key: Option<String>,
) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    let api_key = api_key.ok_or_else(|| {
        anyhow::anyhow!(
            "No OpenWeatherMap API key configured.\n\
                 Hint: run `weather configure` or set the OWM_API_KEY environment variable."
        )
    })?;

    let provider = OpenWeatherProvider::new(
        api_key,
        &config.provider.base_url,
        config.fetch.attempt_timeout(),
    )?;

    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_when_missing_api_key() {
        let cfg = Config::default();
        let err = build_provider(&cfg, cfg.api_key_with_override(None)).unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("No OpenWeatherMap API key configured"));
        assert!(msg.contains("Hint: run `weather configure`"));
    }

    #[test]
    fn works_when_configured() {
        let mut cfg = Config::default();
        cfg.set_api_key("KEY".to_string());

        let provider = build_provider(&cfg, cfg.api_key_with_override(None))
            .expect("provider should build");
        assert_eq!(provider.name(), "openweather");
    }

    #[test]
    fn rejects_plain_http_base_url() {
        let mut cfg = Config::default();
        cfg.set_api_key("KEY".to_string());
        cfg.provider.base_url = "http://api.openweathermap.org/data/2.5".into();

        let err = build_provider(&cfg, cfg.api_key_with_override(None)).unwrap_err();
        assert!(err.to_string().contains("non-HTTPS"));
    }
}

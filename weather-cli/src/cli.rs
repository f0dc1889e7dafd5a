use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use weather_core::{
    CacheStore, Config, CurrentWeather, FetchError, ForecastData, Location, ReportKind,
    SqliteCacheStore, Units, WeatherFetcher, WeatherPayload, WeatherQuery,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Weather CLI")]
pub struct Cli {
    /// Log debug details (cache hits, retries, rate limiting) to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store the OpenWeatherMap API key.
    Configure,

    /// Show weather for one or more locations, fetched concurrently.
    Show {
        /// City ("Paris", "Paris,FR") or coordinates ("48.85,2.35").
        #[arg(required = true)]
        locations: Vec<String>,

        /// metric, imperial or standard.
        #[arg(long, default_value = "metric", value_parser = parse_units)]
        units: Units,

        /// Show the 5-day forecast instead of current conditions.
        #[arg(long)]
        forecast: bool,

        /// Ignore cached data and ask the provider again.
        #[arg(long)]
        refresh: bool,
    },

    /// Manage the local weather cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove expired entries now.
    Purge,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure => configure(),
            Command::Show { locations, units, forecast, refresh } => {
                show(&locations, units, forecast, refresh).await
            }
            Command::Cache { action: CacheAction::Purge } => {
                let removed = purge_cache(&Config::load()?)?;
                println!("Removed {removed} expired cache entr{}.", if removed == 1 { "y" } else { "ies" });
                Ok(())
            }
        }
    }
}

fn configure() -> anyhow::Result<()> {
    let mut config = Config::load()?;

    let api_key = Password::new("OpenWeatherMap API key:")
        .without_confirmation()
        .with_display_mode(PasswordDisplayMode::Masked)
        .prompt()
        .context("Failed to read API key")?;

    let api_key = api_key.trim();
    if api_key.is_empty() {
        bail!("API key cannot be empty");
    }

    config.set_api_key(api_key.to_string());
    config.save()?;

    println!("Saved to {}", Config::config_file_path()?.display());
    Ok(())
}

/// Purge the on-disk cache directly; no provider or API key is involved.
fn purge_cache(config: &Config) -> anyhow::Result<usize> {
    let path = config.cache_db_path()?;
    let store = SqliteCacheStore::open(&path)
        .with_context(|| format!("Failed to open weather cache at {}", path.display()))?;
    Ok(store.purge_expired()?)
}

async fn show(locations: &[String], units: Units, forecast: bool, refresh: bool) -> anyhow::Result<()> {
    let fetcher = WeatherFetcher::from_config(&Config::load()?)?;
    let shutdown = CancellationToken::new();
    let sweeper = fetcher.spawn_sweeper(shutdown.clone());

    let mut pending = JoinSet::new();
    for raw in locations {
        let query = WeatherQuery::new(parse_location(raw), units);
        let query = if forecast { query.with_kind(ReportKind::Forecast) } else { query };

        let handle =
            if refresh { fetcher.spawn_refresh(query) } else { fetcher.spawn_fetch(query) };
        let label = raw.clone();
        pending.spawn(async move { (label, handle.wait().await) });
    }

    let mut failures = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, abandoning {} pending request(s)", pending.len());
                pending.abort_all();
                break;
            }
            next = pending.join_next() => {
                let Some(joined) = next else { break };
                let (label, result) = joined.context("Fetch task panicked")?;
                match result {
                    Ok(payload) => println!("{}", render(&payload)),
                    Err(e) => {
                        failures += 1;
                        eprintln!("{label}: {}", describe(&e));
                    }
                }
            }
        }
    }

    shutdown.cancel();
    sweeper.await.context("Cache sweeper panicked")?;

    if failures > 0 {
        bail!("{failures} of {} location(s) failed", locations.len());
    }
    Ok(())
}

fn parse_units(raw: &str) -> Result<Units, String> {
    Units::try_from(raw).map_err(|e| e.to_string())
}

/// "lat,lon" with two numbers is a coordinate pair; anything else is a city name.
fn parse_location(raw: &str) -> Location {
    if let Some((lat, lon)) = raw.split_once(',') {
        if let (Ok(lat), Ok(lon)) = (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) {
            return Location::Coordinates { lat, lon };
        }
    }
    Location::city(raw)
}

fn describe(error: &FetchError) -> String {
    match error {
        FetchError::ProviderClient { status: 401, .. } => {
            "invalid API key (run `weather configure`)".to_string()
        }
        FetchError::ProviderClient { status: 404, .. } => "location not found".to_string(),
        other => other.to_string(),
    }
}

fn render(payload: &WeatherPayload) -> String {
    match payload {
        WeatherPayload::Current(current) => render_current(current),
        WeatherPayload::Forecast(forecast) => render_forecast(forecast),
    }
}

fn place(city: &str, country: &str) -> String {
    if country.is_empty() { city.to_string() } else { format!("{city}, {country}") }
}

fn render_current(w: &CurrentWeather) -> String {
    let mut out = format!(
        "{}: {} (feels like {}), {}\n",
        place(&w.city, &w.country),
        w.temp_display(),
        w.feels_like_display(),
        w.condition.description
    );
    out.push_str(&format!(
        "  Humidity {}%  Pressure {} hPa  Wind {:.1} {} {}\n",
        w.humidity,
        w.pressure,
        w.wind.speed,
        w.units.wind_speed_symbol(),
        w.wind.direction()
    ));
    if let (Some(sunrise), Some(sunset)) = (w.sunrise, w.sunset) {
        out.push_str(&format!(
            "  Sunrise {}  Sunset {} (UTC)\n",
            sunrise.format("%H:%M"),
            sunset.format("%H:%M")
        ));
    }
    out.push_str(&format!("  Observed {}", w.observation_time.format("%Y-%m-%d %H:%M UTC")));
    out
}

fn render_forecast(f: &ForecastData) -> String {
    let symbol = f.units.temperature_symbol();
    let mut out = format!("{}: {}-day forecast", place(&f.city, &f.country), f.daily.len());

    for day in &f.daily {
        out.push_str(&format!(
            "\n  {}  {:>6.1}{symbol} / {:>6.1}{symbol}  {:<20}  rain {:>3.0}%",
            day.date.format("%a %Y-%m-%d"),
            day.temp_min,
            day.temp_max,
            day.condition.description,
            day.pop * 100.0
        ));
    }
    out
}

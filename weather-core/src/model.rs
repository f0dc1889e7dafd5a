use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FetchError;

const MAX_CITY_LEN: usize = 100;

/// Unit system requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
    Standard,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Units::Metric => "metric",
            Units::Imperial => "imperial",
            Units::Standard => "standard",
        }
    }

    pub fn temperature_symbol(&self) -> &'static str {
        match self {
            Units::Metric => "°C",
            Units::Imperial => "°F",
            Units::Standard => "K",
        }
    }

    pub fn wind_speed_symbol(&self) -> &'static str {
        match self {
            Units::Imperial => "mph",
            Units::Metric | Units::Standard => "m/s",
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Units {
    type Error = FetchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "metric" => Ok(Units::Metric),
            "imperial" => Ok(Units::Imperial),
            "standard" => Ok(Units::Standard),
            _ => Err(FetchError::InvalidQuery(format!(
                "Unknown unit system '{value}'. Supported: metric, imperial, standard."
            ))),
        }
    }
}

/// Which report a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    #[default]
    Current,
    Forecast,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Current => "current",
            ReportKind::Forecast => "forecast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    /// Free-form city name, optionally qualified: "Paris", "Paris,FR", "London, GB".
    City(String),
    Coordinates { lat: f64, lon: f64 },
}

impl Location {
    pub fn city(name: impl Into<String>) -> Self {
        Location::City(name.into())
    }

    fn canonicalize(&self) -> Result<Location, FetchError> {
        match self {
            Location::City(raw) => canonical_city(raw).map(Location::City),
            Location::Coordinates { lat, lon } => {
                if !lat.is_finite() || !(-90.0..=90.0).contains(lat) {
                    return Err(FetchError::InvalidQuery(format!("Latitude out of range: {lat}")));
                }
                if !lon.is_finite() || !(-180.0..=180.0).contains(lon) {
                    return Err(FetchError::InvalidQuery(format!("Longitude out of range: {lon}")));
                }
                Ok(Location::Coordinates { lat: *lat, lon: *lon })
            }
        }
    }

    fn identifier(&self) -> String {
        match self {
            Location::City(name) => name.clone(),
            Location::Coordinates { lat, lon } => format!("{lat:.4},{lon:.4}"),
        }
    }
}

/// Trim, case-fold and collapse whitespace so that equivalent spellings share a cache entry.
fn canonical_city(raw: &str) -> Result<String, FetchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidQuery("City name cannot be empty.".into()));
    }
    if trimmed.chars().count() > MAX_CITY_LEN {
        return Err(FetchError::InvalidQuery("City name too long.".into()));
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '\'' | ',' | '.')))
    {
        return Err(FetchError::InvalidQuery(format!(
            "Invalid character {bad:?} in city name {trimmed:?}"
        )));
    }

    let canonical = trimmed
        .split(',')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .collect::<Vec<_>>()
        .join(",");

    Ok(canonical)
}

/// A weather request as submitted by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherQuery {
    location: Location,
    units: Units,
    kind: ReportKind,
}

impl WeatherQuery {
    pub fn new(location: Location, units: Units) -> Self {
        Self { location, units, kind: ReportKind::Current }
    }

    pub fn current(location: Location, units: Units) -> Self {
        Self::new(location, units)
    }

    pub fn forecast(location: Location, units: Units) -> Self {
        Self { location, units, kind: ReportKind::Forecast }
    }

    pub fn with_kind(mut self, kind: ReportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Validate and normalize the query. This is the only way to obtain a cache key.
    pub fn canonicalize(&self) -> Result<CanonicalQuery, FetchError> {
        let location = self.location.canonicalize()?;
        let key = format!("{}|{}|{}", self.kind.as_str(), location.identifier(), self.units);
        Ok(CanonicalQuery { location, units: self.units, kind: self.kind, key })
    }
}

/// A validated, normalized query together with its derived cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalQuery {
    location: Location,
    units: Units,
    kind: ReportKind,
    key: String,
}

impl CanonicalQuery {
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Cache key, e.g. `current|paris,fr|metric`.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One city-autocomplete / geocoding result, as handed over by the search box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedCity {
    pub name: String,
    pub country: String,
    pub state: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl GeocodedCity {
    pub fn display_name(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        if let Some(state) = self.state.as_deref().filter(|s| !s.is_empty()) {
            parts.push(state);
        }
        parts.push(self.country.as_str());
        parts.join(", ")
    }

    /// Query by coordinates, which is unambiguous where the name is not.
    pub fn to_query(&self, units: Units, kind: ReportKind) -> WeatherQuery {
        WeatherQuery::new(Location::Coordinates { lat: self.lat, lon: self.lon }, units)
            .with_kind(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: u32,
    pub main: String,
    pub description: String,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindData {
    pub speed: f64,
    pub deg: Option<f64>,
    pub gust: Option<f64>,
}

impl WindData {
    /// 16-point compass direction the wind blows from, or "N/A".
    pub fn direction(&self) -> &'static str {
        const POINTS: [&str; 16] = [
            "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW",
            "NW", "NNW",
        ];
        match self.deg {
            Some(deg) if deg.is_finite() => {
                let idx = (deg.rem_euclid(360.0) / 22.5).round() as usize % 16;
                POINTS[idx]
            }
            _ => "N/A",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub city: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub observation_time: DateTime<Utc>,
    pub temp: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: u8,
    pub pressure: u32,
    pub visibility: Option<u32>,
    pub wind: WindData,
    pub condition: Condition,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
    pub units: Units,
}

impl CurrentWeather {
    pub fn temp_display(&self) -> String {
        format!("{:.1}{}", self.temp, self.units.temperature_symbol())
    }

    pub fn feels_like_display(&self) -> String {
        format!("{:.1}{}", self.feels_like, self.units.temperature_symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub time: DateTime<Utc>,
    pub temp: f64,
    pub feels_like: f64,
    pub humidity: u8,
    pub wind: WindData,
    pub condition: Condition,
    /// Probability of precipitation, 0.0..=1.0.
    pub pop: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: u8,
    pub wind: WindData,
    pub condition: Condition,
    pub pop: f64,
    pub hourly: Vec<HourlyForecast>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastData {
    pub city: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub daily: Vec<DailyForecast>,
    pub hourly: Vec<HourlyForecast>,
    pub units: Units,
}

/// What a fetch returns and what the cache stores (serialized as JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WeatherPayload {
    Current(CurrentWeather),
    Forecast(ForecastData),
}

impl WeatherPayload {
    pub fn kind(&self) -> ReportKind {
        match self {
            WeatherPayload::Current(_) => ReportKind::Current,
            WeatherPayload::Forecast(_) => ReportKind::Forecast,
        }
    }

    pub fn into_current(self) -> Option<CurrentWeather> {
        match self {
            WeatherPayload::Current(current) => Some(current),
            WeatherPayload::Forecast(_) => None,
        }
    }

    pub fn into_forecast(self) -> Option<ForecastData> {
        match self {
            WeatherPayload::Forecast(forecast) => Some(forecast),
            WeatherPayload::Current(_) => None,
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, time::Duration};
use url::Url;

use crate::{
    error::FetchError,
    model::{
        CanonicalQuery, Condition, CurrentWeather, DailyForecast, ForecastData, HourlyForecast,
        Location, ReportKind, Units, WeatherPayload, WindData,
    },
};

use super::WeatherProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";
const USER_AGENT: &str = concat!("weather-core/", env!("CARGO_PKG_VERSION"));
/// 5 days of 3-hour steps.
const FORECAST_ENTRIES: &str = "40";

#[derive(Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: Url,
    http: Client,
}

impl fmt::Debug for OpenWeatherProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenWeatherProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

/// Parse `url` and refuse anything that is not `https://`.
pub fn require_https(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url)
        .map_err(|e| FetchError::InsecureEndpoint(format!("invalid endpoint {url:?}: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(FetchError::InsecureEndpoint(format!(
            "{url} (only https:// endpoints are allowed)"
        )));
    }
    Ok(parsed)
}

impl OpenWeatherProvider {
    /// `attempt_timeout` bounds one HTTP exchange, connect through body.
    pub fn new(api_key: String, base_url: &str, attempt_timeout: Duration) -> Result<Self, FetchError> {
        let base_url = require_https(base_url)?;
        let http = Client::builder()
            .https_only(true)
            .timeout(attempt_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::InsecureEndpoint(format!("failed to build TLS client: {e}")))?;

        Ok(Self { api_key, base_url, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn get_body(&self, path: &str, params: &[(&str, String)]) -> Result<String, FetchError> {
        let url = self.endpoint(path);
        // The key is attached after logging so it never reaches the logs.
        tracing::debug!(%url, ?params, "GET");

        let res = self
            .http
            .get(&url)
            .query(params)
            .query(&[("appid", self.api_key.as_str())])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| {
                FetchError::Network(format!("failed to read response body: {}", e.without_url()))
            })?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        Ok(body)
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn name(&self) -> &'static str {
        "openweather"
    }

    async fn get_weather(&self, query: &CanonicalQuery) -> Result<WeatherPayload, FetchError> {
        let units = query.units();
        let mut params = match query.location() {
            Location::City(name) => vec![("q", name.clone())],
            Location::Coordinates { lat, lon } => {
                vec![("lat", lat.to_string()), ("lon", lon.to_string())]
            }
        };
        params.push(("units", units.as_str().to_owned()));

        match query.kind() {
            ReportKind::Current => {
                let body = self.get_body("weather", &params).await?;
                parse_current(&body, units).map(WeatherPayload::Current)
            }
            ReportKind::Forecast => {
                params.push(("cnt", FORECAST_ENTRIES.to_owned()));
                let body = self.get_body("forecast", &params).await?;
                parse_forecast(&body, units).map(WeatherPayload::Forecast)
            }
        }
    }
}

fn is_tls_failure(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let msg = e.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Map a reqwest failure to the error taxonomy. The URL is stripped first:
/// it carries the `appid` query parameter.
fn classify_transport_error(err: reqwest::Error) -> FetchError {
    let err = err.without_url();
    if err.is_timeout() {
        FetchError::Network(format!("request timed out: {err}"))
    } else if is_tls_failure(&err) || err.is_builder() || err.is_redirect() {
        FetchError::InsecureEndpoint(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct OwErrorBody {
    message: Option<String>,
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let upstream = serde_json::from_str::<OwErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| truncate_body(body));

    let message = match status {
        StatusCode::UNAUTHORIZED => format!("Invalid API key ({upstream})"),
        StatusCode::NOT_FOUND => format!("Location not found ({upstream})"),
        StatusCode::TOO_MANY_REQUESTS => format!("Provider rate limit exceeded ({upstream})"),
        _ => upstream,
    };

    if status.is_client_error() {
        FetchError::ProviderClient { status: status.as_u16(), message }
    } else if status.is_server_error() {
        FetchError::ProviderServer { status: status.as_u16(), message }
    } else {
        FetchError::MalformedResponse(format!("unexpected status {status}: {message}"))
    }
}

#[derive(Debug, Deserialize)]
struct OwCoord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    feels_like: f64,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    humidity: u8,
    #[serde(default)]
    pressure: u32,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    id: u32,
    main: String,
    description: String,
    icon: String,
}

#[derive(Debug, Deserialize, Default)]
struct OwWind {
    #[serde(default)]
    speed: f64,
    deg: Option<f64>,
    gust: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct OwSys {
    country: Option<String>,
    sunrise: Option<i64>,
    sunset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    name: String,
    coord: OwCoord,
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    #[serde(default)]
    wind: OwWind,
    visibility: Option<u32>,
    #[serde(default)]
    sys: OwSys,
}

#[derive(Debug, Deserialize)]
struct OwCity {
    name: String,
    #[serde(default)]
    country: String,
    coord: Option<OwCoord>,
}

#[derive(Debug, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    #[serde(default)]
    wind: OwWind,
    #[serde(default)]
    pop: f64,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    city: OwCity,
    list: Vec<OwForecastEntry>,
}

impl From<OwWind> for WindData {
    fn from(w: OwWind) -> Self {
        WindData { speed: w.speed, deg: w.deg, gust: w.gust }
    }
}

fn condition(weather: &[OwWeather]) -> Result<Condition, FetchError> {
    let w = weather
        .first()
        .ok_or_else(|| FetchError::MalformedResponse("response has no weather condition".into()))?;

    Ok(Condition {
        id: w.id,
        main: w.main.clone(),
        description: capitalize(&w.description),
        icon: w.icon.clone(),
    })
}

/// Parse an OpenWeatherMap `/weather` body.
pub fn parse_current(body: &str, units: Units) -> Result<CurrentWeather, FetchError> {
    let parsed: OwCurrentResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("current weather JSON: {e}")))?;

    let condition = condition(&parsed.weather)?;

    Ok(CurrentWeather {
        city: parsed.name,
        country: parsed.sys.country.unwrap_or_default(),
        lat: parsed.coord.lat,
        lon: parsed.coord.lon,
        observation_time: unix_to_utc(parsed.dt)?,
        temp: parsed.main.temp,
        feels_like: parsed.main.feels_like,
        temp_min: parsed.main.temp_min.unwrap_or(parsed.main.temp),
        temp_max: parsed.main.temp_max.unwrap_or(parsed.main.temp),
        humidity: parsed.main.humidity,
        pressure: parsed.main.pressure,
        visibility: parsed.visibility,
        wind: parsed.wind.into(),
        condition,
        sunrise: parsed.sys.sunrise.map(unix_to_utc).transpose()?,
        sunset: parsed.sys.sunset.map(unix_to_utc).transpose()?,
        units,
    })
}

/// Parse an OpenWeatherMap `/forecast` body and aggregate it per UTC day.
pub fn parse_forecast(body: &str, units: Units) -> Result<ForecastData, FetchError> {
    let parsed: OwForecastResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("forecast JSON: {e}")))?;

    if parsed.list.is_empty() {
        return Err(FetchError::MalformedResponse("forecast response contained no entries".into()));
    }

    let hourly = parsed
        .list
        .into_iter()
        .map(|entry| {
            Ok(HourlyForecast {
                time: unix_to_utc(entry.dt)?,
                temp: entry.main.temp,
                feels_like: entry.main.feels_like,
                humidity: entry.main.humidity,
                condition: condition(&entry.weather)?,
                wind: entry.wind.into(),
                pop: entry.pop,
            })
        })
        .collect::<Result<Vec<_>, FetchError>>()?;

    let mut by_day: BTreeMap<NaiveDate, Vec<HourlyForecast>> = BTreeMap::new();
    for hour in &hourly {
        by_day.entry(hour.time.date_naive()).or_default().push(hour.clone());
    }

    let daily = by_day.into_iter().filter_map(|(date, hours)| daily_summary(date, hours)).collect();
    let (lat, lon) = parsed.city.coord.map(|c| (c.lat, c.lon)).unwrap_or((0.0, 0.0));

    Ok(ForecastData {
        city: parsed.city.name,
        country: parsed.city.country,
        lat,
        lon,
        daily,
        hourly,
        units,
    })
}

fn daily_summary(date: NaiveDate, hours: Vec<HourlyForecast>) -> Option<DailyForecast> {
    let midday = hours.get(hours.len() / 2)?;
    let temp_min = hours.iter().map(|h| h.temp).fold(f64::INFINITY, f64::min);
    let temp_max = hours.iter().map(|h| h.temp).fold(f64::NEG_INFINITY, f64::max);
    let humidity = hours.iter().map(|h| f64::from(h.humidity)).sum::<f64>() / hours.len() as f64;
    let pop = hours.iter().map(|h| h.pop).fold(0.0, f64::max);

    Some(DailyForecast {
        date,
        temp_min,
        temp_max,
        humidity: humidity.round() as u8,
        wind: midday.wind.clone(),
        condition: midday.condition.clone(),
        pop,
        hourly: hours,
    })
}

fn unix_to_utc(ts: i64) -> Result<DateTime<Utc>, FetchError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| FetchError::MalformedResponse(format!("timestamp out of range: {ts}")))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn current_fixture() -> serde_json::Value {
        json!({
            "coord": {"lon": -0.1257, "lat": 51.5085},
            "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
            "main": {
                "temp": 18.5, "feels_like": 17.2, "temp_min": 16.0,
                "temp_max": 21.0, "humidity": 60, "pressure": 1015
            },
            "visibility": 10000,
            "wind": {"speed": 4.1, "deg": 270, "gust": 6.2},
            "dt": 1_700_000_000,
            "sys": {"country": "GB", "sunrise": 1_699_999_000, "sunset": 1_700_020_000},
            "name": "London"
        })
    }

    fn forecast_fixture() -> serde_json::Value {
        let list: Vec<_> = (0..40)
            .map(|i| {
                json!({
                    "dt": 1_700_000_000 + i * 10_800,
                    "main": {"temp": 18.0 + i as f64, "feels_like": 17.0, "humidity": 60, "pressure": 1015},
                    "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
                    "wind": {"speed": 3.5, "deg": 200},
                    "pop": 0.1 * (i % 3) as f64
                })
            })
            .collect();

        json!({
            "city": {"name": "London", "country": "GB", "coord": {"lat": 51.5, "lon": -0.12}},
            "list": list
        })
    }

    #[test]
    fn parses_current_weather() {
        let w = parse_current(&current_fixture().to_string(), Units::Metric).unwrap();

        assert_eq!(w.city, "London");
        assert_eq!(w.country, "GB");
        assert!((w.temp - 18.5).abs() < f64::EPSILON);
        assert!((w.temp_max - 21.0).abs() < f64::EPSILON);
        assert_eq!(w.humidity, 60);
        assert_eq!(w.pressure, 1015);
        assert_eq!(w.wind.direction(), "W");
        assert_eq!(w.condition.main, "Clear");
        assert_eq!(w.condition.description, "Clear sky");
        assert_eq!(w.observation_time.timestamp(), 1_700_000_000);
        assert!(w.sunrise.is_some() && w.sunset.is_some());
        assert_eq!(w.temp_display(), "18.5°C");
    }

    #[test]
    fn current_weather_defaults_optional_fields() {
        let mut body = current_fixture();
        let obj = body.as_object_mut().unwrap();
        obj.remove("sys");
        obj.remove("wind");
        obj.remove("visibility");
        obj["main"].as_object_mut().unwrap().remove("temp_min");

        let w = parse_current(&body.to_string(), Units::Imperial).unwrap();
        assert_eq!(w.country, "");
        assert_eq!(w.visibility, None);
        assert!((w.temp_min - 18.5).abs() < f64::EPSILON);
        assert_eq!(w.wind.direction(), "N/A");
        assert_eq!(w.temp_display(), "18.5°F");
    }

    #[test]
    fn missing_condition_is_malformed() {
        let mut body = current_fixture();
        body["weather"] = json!([]);
        let err = parse_current(&body.to_string(), Units::Metric).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_current("<html>oops</html>", Units::Metric).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn parses_and_groups_forecast() {
        let f = parse_forecast(&forecast_fixture().to_string(), Units::Metric).unwrap();

        assert_eq!(f.city, "London");
        assert_eq!(f.country, "GB");
        assert_eq!(f.hourly.len(), 40);
        assert!(f.daily.len() >= 5);
        assert_eq!(f.daily.iter().map(|d| d.hourly.len()).sum::<usize>(), 40);

        for day in &f.daily {
            assert!(day.temp_min <= day.temp_max);
            assert_eq!(day.humidity, 60);
        }
        assert!(f.daily.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn empty_forecast_is_malformed() {
        let body = json!({"city": {"name": "London"}, "list": []});
        assert!(parse_forecast(&body.to_string(), Units::Metric).is_err());
    }

    #[test]
    fn status_classification() {
        let err = classify_status(StatusCode::NOT_FOUND, r#"{"cod":"404","message":"city not found"}"#);
        assert!(matches!(err, FetchError::ProviderClient { status: 404, .. }));
        assert!(err.to_string().contains("city not found"));
        assert!(!err.is_retryable());

        let err = classify_status(StatusCode::UNAUTHORIZED, "");
        assert!(err.to_string().contains("Invalid API key"));
        assert!(!err.is_retryable());

        let err = classify_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, FetchError::ProviderServer { status: 502, .. }));
        assert!(err.is_retryable());

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_retryable());
    }

    #[test]
    fn https_is_required() {
        assert!(require_https("https://api.openweathermap.org/data/2.5").is_ok());

        let err = require_https("http://api.openweathermap.org/data/2.5").unwrap_err();
        assert!(matches!(err, FetchError::InsecureEndpoint(_)));
        assert!(require_https("not a url").is_err());

        let err = OpenWeatherProvider::new("k".into(), "http://example.com", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, FetchError::InsecureEndpoint(_)));
    }

    #[test]
    fn debug_output_hides_api_key() {
        let provider =
            OpenWeatherProvider::new("SECRET".into(), DEFAULT_BASE_URL, Duration::from_secs(5))
                .unwrap();
        let dbg = format!("{provider:?}");
        assert!(!dbg.contains("SECRET"));
        assert_eq!(provider.endpoint("weather"), format!("{DEFAULT_BASE_URL}/weather"));
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_the_api_key() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                drop(stream);
            }
        });

        let provider = OpenWeatherProvider::new(
            "TOPSECRETKEY".into(),
            &format!("https://127.0.0.1:{port}"),
            Duration::from_secs(5),
        )
        .unwrap();
        let query = crate::model::WeatherQuery::current(Location::city("Paris"), Units::Metric)
            .canonicalize()
            .unwrap();

        let err = provider.get_weather(&query).await.unwrap_err();
        let text = format!("{err} {err:?}");
        assert!(!text.contains("TOPSECRETKEY"), "key leaked: {text}");
        assert!(!text.contains("appid"), "query string leaked: {text}");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let err = classify_status(StatusCode::INTERNAL_SERVER_ERROR, &body);
        assert!(err.to_string().len() < 300);
    }
}

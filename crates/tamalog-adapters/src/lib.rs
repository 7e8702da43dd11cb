//! Source adapter contract + the two concrete upstream adapters.
//!
//! Each adapter turns one remote endpoint into a normalized string value
//! and converts every transport or shape problem into a typed
//! [`FetchError`] at its own boundary. Parsing is kept in free functions
//! so it can be exercised against captured fixtures without a network.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tamalog_core::DelayStatus;
use tamalog_storage::{HttpError, HttpFetcher};

pub const CRATE_NAME: &str = "tamalog-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport: {0}")]
    Transport(#[from] HttpError),
    #[error("parse: {0}")]
    Parse(String),
}

/// One remote signal. Implementations never retry and never panic past
/// this boundary; the caller decides what a failed field looks like.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, http: &HttpFetcher) -> Result<String, FetchError>;
}

/// JMA public forecast feed: a time-indexed series per office, keyed by
/// region code inside each series.
#[derive(Debug, Clone)]
pub struct WeatherAdapter {
    forecast_url: String,
    region_code: String,
}

impl WeatherAdapter {
    pub fn new(forecast_base: &str, office_code: &str, region_code: &str) -> Self {
        Self {
            forecast_url: format!("{}/{office_code}.json", forecast_base.trim_end_matches('/')),
            region_code: region_code.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for WeatherAdapter {
    fn source_id(&self) -> &'static str {
        "jma-forecast"
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<String, FetchError> {
        let body = http.fetch_text(&self.forecast_url).await?;
        let today = Local::now().format("%Y-%m-%d").to_string();
        parse_forecast(&body, &self.region_code, &today)
    }
}

/// Walk the forecast document to the weather text for `region_code` on the
/// time slot whose definition contains `date`. Any deviation from the
/// expected shape falls through to a parse error naming what was missing.
pub fn parse_forecast(body: &str, region_code: &str, date: &str) -> Result<String, FetchError> {
    let root: JsonValue = serde_json::from_str(body)
        .map_err(|err| FetchError::Parse(format!("invalid forecast JSON: {err}")))?;
    let offices = root
        .as_array()
        .ok_or_else(|| FetchError::Parse("forecast root is not an array".into()))?;

    for office in offices {
        let Some(series_list) = office.get("timeSeries").and_then(JsonValue::as_array) else {
            continue;
        };
        for series in series_list {
            let Some(times) = series.get("timeDefines").and_then(JsonValue::as_array) else {
                continue;
            };
            let Some(areas) = series.get("areas").and_then(JsonValue::as_array) else {
                continue;
            };
            for region in areas {
                if region.pointer("/area/code").and_then(JsonValue::as_str) != Some(region_code) {
                    continue;
                }
                let Some(weathers) = region.get("weathers").and_then(JsonValue::as_array) else {
                    continue;
                };
                for (i, slot) in times.iter().enumerate() {
                    if slot.as_str().is_some_and(|t| t.contains(date)) {
                        if let Some(weather) = weathers.get(i).and_then(JsonValue::as_str) {
                            return Ok(weather.to_string());
                        }
                    }
                }
            }
        }
    }

    Err(FetchError::Parse(format!(
        "no weather entry for region {region_code} on {date}"
    )))
}

/// Transit-status page scrape: the page carries a `dd.trouble` element
/// only while service is disrupted.
#[derive(Debug, Clone)]
pub struct DelayStatusAdapter {
    status_url: String,
    pacing: Duration,
}

impl DelayStatusAdapter {
    pub fn new(status_url: impl Into<String>, pacing: Duration) -> Self {
        Self {
            status_url: status_url.into(),
            pacing,
        }
    }
}

#[async_trait]
impl SourceAdapter for DelayStatusAdapter {
    fn source_id(&self) -> &'static str {
        "tama-monorail-status"
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<String, FetchError> {
        let body = http.fetch_text(&self.status_url).await?;
        let status = parse_delay_markup(&body)?;
        // Courtesy pacing toward the upstream, kept even on the happy path.
        tokio::time::sleep(self.pacing).await;
        Ok(status.as_str().to_string())
    }
}

/// Presence of the trouble marker means delayed; absence means normal
/// service, not an error.
pub fn parse_delay_markup(body: &str) -> Result<DelayStatus, FetchError> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("dd.trouble")
        .map_err(|err| FetchError::Parse(format!("invalid trouble selector: {err}")))?;
    if document.select(&selector).next().is_some() {
        Ok(DelayStatus::Delayed)
    } else {
        Ok(DelayStatus::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORECAST_FIXTURE: &str = r#"[
      {
        "publishingOffice": "気象庁",
        "timeSeries": [
          {
            "timeDefines": [
              "2026-03-01T05:00:00+09:00",
              "2026-03-02T05:00:00+09:00"
            ],
            "areas": [
              {
                "area": { "name": "伊豆諸島", "code": "130030" },
                "weathers": ["くもり", "雨"]
              },
              {
                "area": { "name": "東京地方", "code": "130010" },
                "weathers": ["晴れ時々くもり", "くもり一時雨"]
              }
            ]
          }
        ]
      }
    ]"#;

    #[test]
    fn forecast_picks_the_matching_region_and_day() {
        let weather = parse_forecast(FORECAST_FIXTURE, "130010", "2026-03-02").unwrap();
        assert_eq!(weather, "くもり一時雨");
    }

    #[test]
    fn forecast_without_the_region_is_a_parse_error() {
        let err = parse_forecast(FORECAST_FIXTURE, "999999", "2026-03-01").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(err.to_string().contains("999999"));
    }

    #[test]
    fn forecast_without_the_date_is_a_parse_error() {
        let err = parse_forecast(FORECAST_FIXTURE, "130010", "2026-12-31").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn malformed_forecast_json_is_a_parse_error() {
        let err = parse_forecast("{not json", "130010", "2026-03-01").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn forecast_root_must_be_an_array() {
        let err = parse_forecast(r#"{"timeSeries": []}"#, "130010", "2026-03-01").unwrap_err();
        assert!(err.to_string().contains("not an array"));
    }

    #[test]
    fn trouble_marker_means_delayed() {
        let page = r#"<html><body>
            <dl><dt>運行情報</dt>
            <dd class="trouble"><span>遅延が発生しています</span></dd></dl>
        </body></html>"#;
        assert_eq!(parse_delay_markup(page).unwrap(), DelayStatus::Delayed);
    }

    #[test]
    fn absent_trouble_marker_means_normal_service() {
        let page = r#"<html><body>
            <dl><dt>運行情報</dt>
            <dd class="normal">平常運転</dd></dl>
        </body></html>"#;
        assert_eq!(parse_delay_markup(page).unwrap(), DelayStatus::Normal);
    }

    #[test]
    fn trouble_class_on_another_element_does_not_count() {
        let page = r#"<p class="trouble">unrelated</p>"#;
        assert_eq!(parse_delay_markup(page).unwrap(), DelayStatus::Normal);
    }
}

//! `get_weather`: current conditions from a wttr.in-compatible service.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use parley_core::config::WeatherConfig;

use crate::{Tool, ToolContext, ToolOutput};

pub struct GetWeatherTool {
    base_url: String,
    imperial: bool,
    client: reqwest::Client,
}

impl GetWeatherTool {
    pub fn new(config: &WeatherConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            imperial: config.units == "imperial",
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(8))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url_for(&self, city: &str) -> anyhow::Result<url::Url> {
        let mut url = url::Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("weather base_url cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .push(city);
        url.query_pairs_mut().append_pair("format", "j1");
        Ok(url)
    }
}

#[derive(Deserialize)]
struct Params {
    city: String,
}

#[derive(Debug, Deserialize)]
struct WttrResponse {
    #[serde(default)]
    current_condition: Vec<CurrentCondition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentCondition {
    #[serde(rename = "temp_C")]
    temp_c: String,
    #[serde(rename = "temp_F")]
    temp_f: String,
    #[serde(default)]
    humidity: Option<String>,
    #[serde(default)]
    weather_desc: Vec<TextValue>,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

/// Reduce a wttr.in `format=j1` body to the fields worth speaking.
fn summarize(city: &str, body: &str, imperial: bool) -> anyhow::Result<serde_json::Value> {
    let parsed: WttrResponse = serde_json::from_str(body)?;
    let current = parsed
        .current_condition
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no current conditions for {city}"))?;
    let raw_temp = if imperial { &current.temp_f } else { &current.temp_c };
    let temp: i64 = raw_temp.trim().parse()?;
    let condition = current
        .weather_desc
        .first()
        .map(|d| d.value.trim().to_lowercase())
        .unwrap_or_default();
    let humidity = current.humidity.and_then(|h| h.trim().parse::<i64>().ok());
    Ok(json!({
        "city": city,
        "temp": temp,
        "units": if imperial { "fahrenheit" } else { "celsius" },
        "condition": condition,
        "humidity": humidity,
    }))
}

#[async_trait]
impl Tool for GetWeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a city: temperature, condition and humidity."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "city": {
                    "type": "string",
                    "description": "City name, e.g. \"Paris\""
                }
            },
            "required": ["city"]
        })
    }

    async fn execute(&self, params: serde_json::Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let p: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Invalid arguments: {e}"))),
        };
        let city = p.city.trim();
        if city.is_empty() {
            return Ok(ToolOutput::error("city must not be empty"));
        }

        let url = self.url_for(city)?;
        debug!(%url, "get_weather");

        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(ToolOutput::error(format!("Weather service unreachable: {e}"))),
        };
        let status = resp.status();
        if !status.is_success() {
            return Ok(ToolOutput::error(format!("Weather service returned HTTP {status} for {city}")));
        }
        let body = resp.text().await?;
        match summarize(city, &body, self.imperial) {
            Ok(summary) => Ok(ToolOutput::ok(summary.to_string())),
            Err(e) => Ok(ToolOutput::error(format!("Unexpected weather data for {city}: {e}"))),
        }
    }
}

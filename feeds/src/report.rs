//! Report buffers and the JSON decoders that build them.

use crate::FeedError;
use log::warn;
use serde::Deserialize;
use serde_json::Value;

/// Size of a report buffer, terminator included.
pub const MAX_REPORT_LEN: usize = 8192;

/// Report text followed by exactly one NUL byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    bytes: Vec<u8>,
}

impl Report {
    /// Builds a report from text. Anything after an embedded NUL is dropped
    /// and the text is cut to fit the report buffer.
    pub fn from_text(text: &str) -> Result<Self, FeedError> {
        let mut text = text.split('\0').next().unwrap_or_default();
        if text.len() > MAX_REPORT_LEN - 1 {
            let mut end = MAX_REPORT_LEN - 1;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text = &text[..end];
        }
        if text.is_empty() {
            return Err(FeedError::Empty);
        }

        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        Ok(Self { bytes })
    }

    /// Text without the terminator.
    pub fn text(&self) -> &str {
        // Built from a &str, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.bytes.len() - 1]).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: Option<String>,
    #[serde(flatten)]
    body: T,
}

impl<T> Envelope<T> {
    fn into_body(self) -> Result<T, FeedError> {
        match self.status.as_deref() {
            Some("success") => Ok(self.body),
            Some(other) => Err(FeedError::Status(other.to_string())),
            None => Err(FeedError::MissingField("status")),
        }
    }
}

#[derive(Deserialize)]
struct PostBody {
    tweet: Option<Post>,
}

#[derive(Deserialize)]
struct Post {
    text: Option<String>,
}

#[derive(Deserialize)]
struct WeatherBody {
    data: Option<WeatherData>,
}

#[derive(Deserialize)]
struct WeatherData {
    consolidated_weather: Option<Vec<DayForecast>>,
}

#[derive(Deserialize)]
struct DayForecast {
    applicable_date: String,
    weather_state_name: String,
    min_temp: f64,
    max_temp: f64,
    humidity: i64,
}

#[derive(Deserialize)]
struct AirQualityBody {
    data: Option<Vec<Value>>,
}

pub fn decode_post(body: &str) -> Result<Report, FeedError> {
    let post = serde_json::from_str::<Envelope<PostBody>>(body)?
        .into_body()?
        .tweet
        .ok_or(FeedError::MissingField("tweet"))?;
    let text = post.text.ok_or(FeedError::MissingField("text"))?;
    Report::from_text(&text)
}

pub fn decode_weather(body: &str) -> Result<Report, FeedError> {
    let days = serde_json::from_str::<Envelope<WeatherBody>>(body)?
        .into_body()?
        .data
        .ok_or(FeedError::MissingField("data"))?
        .consolidated_weather
        .ok_or(FeedError::MissingField("consolidated_weather"))?;

    let mut text = String::new();
    for day in &days {
        text.push_str(&format!(
            "Date: {}\n\tWeather: {}\n\tMin. temp: {:.2}\n\tMax. temp: {:.2}\n\tHumidity: {}\n",
            day.applicable_date, day.weather_state_name, day.min_temp, day.max_temp, day.humidity
        ));
    }
    Report::from_text(&text)
}

/// Only the first field of each record is reported.
pub fn decode_air_quality(body: &str) -> Result<Report, FeedError> {
    let records = serde_json::from_str::<Envelope<AirQualityBody>>(body)?
        .into_body()?
        .data
        .ok_or(FeedError::MissingField("data"))?;

    let mut text = String::new();
    for (index, record) in records.iter().enumerate() {
        let Some((location, reading)) = record.as_object().and_then(|o| o.iter().next()) else {
            warn!("air-quality record {} has no fields, skipping: {}", index, record);
            continue;
        };
        match reading {
            Value::String(s) => text.push_str(&format!("{}: {}\n", location, s)),
            other => text.push_str(&format!("{}: {}\n", location, other)),
        }
    }
    Report::from_text(&text)
}

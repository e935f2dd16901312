//! Data feeds served to the guest through streaming port devices.
//!
//! Each feed is fetched from the sparkler web service and rendered into a
//! NUL-terminated [`Report`]. Every fetch returns a fresh owned report; there
//! is no shared staging buffer between calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod http;
pub mod report;

pub use http::HttpFeedSource;
pub use report::{Report, MAX_REPORT_LEN};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service reported status {0:?}")]
    Status(String),

    #[error("response is missing field `{0}`")]
    MissingField(&'static str),

    #[error("service returned no data")]
    Empty,
}

/// A feed together with the arguments it is fetched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feed", rename_all = "snake_case")]
pub enum Feed {
    /// Latest social-media post.
    Post,
    /// Multi-day forecast for a city.
    Weather { city: String },
    /// Air-quality readings for a city.
    AirQuality { country: String, city: String },
}

impl Feed {
    pub fn weather(city: &str) -> Self {
        Feed::Weather {
            city: city.to_string(),
        }
    }

    pub fn air_quality(country: &str, city: &str) -> Self {
        Feed::AirQuality {
            country: country.to_string(),
            city: city.to_string(),
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feed::Post => write!(f, "post"),
            Feed::Weather { city } => write!(f, "weather({})", city),
            Feed::AirQuality { country, city } => write!(f, "air-quality({}/{})", country, city),
        }
    }
}

/// Something that can produce a report for a feed.
///
/// Implementations block until the report is available. An `Ok` report is
/// never empty.
pub trait FeedSource {
    fn fetch(&self, feed: &Feed) -> Result<Report, FeedError>;
}

//! Blocking HTTP client for the sparkler web service.

use crate::report::{decode_air_quality, decode_post, decode_weather};
use crate::{Feed, FeedError, FeedSource, Report};
use log::{debug, info};
use reqwest::blocking::{Client, Request};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://sparkler-service.herokuapp.com";
pub const DEFAULT_USER_AGENT: &str = "sparkler-agent/1.0";

/// Fetches feeds over HTTP, one request per call.
pub struct HttpFeedSource {
    client: Client,
    base_url: String,
}

impl HttpFeedSource {
    /// Create a client for `base_url`. With `timeout` unset a request may
    /// block indefinitely.
    pub fn new(
        base_url: &str,
        user_agent: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, FeedError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build the request for a feed. Query values are percent-encoded here,
    /// so city names are passed verbatim.
    pub fn request(&self, feed: &Feed) -> Result<Request, FeedError> {
        let builder = match feed {
            Feed::Post => self.client.get(format!("{}/tweet", self.base_url)),
            Feed::Weather { city } => self
                .client
                .get(format!("{}/weather", self.base_url))
                .query(&[("city", city)]),
            Feed::AirQuality { country, city } => self
                .client
                .get(format!("{}/air_quality", self.base_url))
                .query(&[("country", country), ("city", city)]),
        };
        Ok(builder.build()?)
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self, feed: &Feed) -> Result<Report, FeedError> {
        let request = self.request(feed)?;
        debug!("GET {}", request.url());

        let body = self.client.execute(request)?.error_for_status()?.text()?;
        info!("{} bytes retrieved for {}", body.len(), feed);

        match feed {
            Feed::Post => decode_post(&body),
            Feed::Weather { .. } => decode_weather(&body),
            Feed::AirQuality { .. } => decode_air_quality(&body),
        }
    }
}

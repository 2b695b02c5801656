//! HTTP keyboard emulator client

use dutlink_common::Result;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keyboard emulator reachable over HTTP.
///
/// Accepts `POST <url>/cmd` with either a `key` or a `type` form field.
#[derive(Debug, Clone)]
pub struct KeyboardEmulator {
    client: Client,
    url: String,
}

impl KeyboardEmulator {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn post(&self, field: &str, value: &str) -> Result<()> {
        let endpoint = format!("{}/cmd", self.url);
        debug!("Keyboard emulator {} <- {}={:?}", endpoint, field, value);
        self.client
            .post(&endpoint)
            .form(&[(field, value)])
            .send()?
            .error_for_status()?;
        Ok(())
    }

    pub fn send_key(&self, key: &str) -> Result<()> {
        self.post("key", key)
    }

    pub fn type_string(&self, text: &str) -> Result<()> {
        self.post("type", text)
    }
}

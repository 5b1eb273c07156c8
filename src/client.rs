use crate::prelude::*;
use crate::batch::{batches, MAX_BATCH_SIZE};
use crate::codec::{self, ParamMap};
use crate::error::{DeviceResult, Error};
use crate::register::{Register, WriteAck};

use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const READ_PATH: &str = "getregister.cgi";
const WRITE_PATH: &str = "setregister.cgi";

pub const MANUFACTURER: &str = "Evopell";

// device identity registers, read once at setup
pub const TAG_DEVICE_ID: &str = "devid";
pub const TAG_NAME: &str = "devname";
pub const TAG_FIRMWARE: &str = "fwver";
pub const TAG_HARDWARE: &str = "hwver";
pub const TAG_MAC: &str = "mac";
pub const TAG_TYPE: &str = "devtype";
pub const TAG_IP: &str = "ip";

pub const DEVICE_INFO_TAGS: [&str; 7] = [
    TAG_DEVICE_ID,
    TAG_NAME,
    TAG_FIRMWARE,
    TAG_HARDWARE,
    TAG_MAC,
    TAG_TYPE,
    TAG_IP,
];

// RetryPolicy {{{
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
} // }}}

// DeviceInfo {{{
/// Static identity of the controller.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub name: String,
    pub serial: String,
    pub mac: String,
    pub sw_version: String,
    pub hw_version: String,
    pub configuration_url: String,
}

impl DeviceInfo {
    /// Builds the identity from the raw probe values, failing if any of them
    /// is missing from the reply.
    pub fn from_values(values: &HashMap<String, String>) -> DeviceResult<Self> {
        let got = DEVICE_INFO_TAGS
            .iter()
            .filter(|t| values.contains_key(**t))
            .count();
        if got < DEVICE_INFO_TAGS.len() {
            return Err(Error::Setup {
                expected: DEVICE_INFO_TAGS.len(),
                got,
            });
        }

        let get = |tag: &str| values.get(tag).map(|v| v.trim().to_string()).unwrap_or_default();
        let mac = get(TAG_MAC);

        Ok(Self {
            manufacturer: MANUFACTURER.to_string(),
            model: get(TAG_TYPE),
            name: get(TAG_NAME),
            serial: format!("{}-{}", get(TAG_DEVICE_ID), mac),
            mac: format_mac(&mac),
            sw_version: get(TAG_FIRMWARE),
            hw_version: get(TAG_HARDWARE),
            configuration_url: format!("http://{}", get(TAG_IP)),
        })
    }
}

/// Normalises a MAC address to lower-case colon separated pairs. Anything
/// that is not 12 hex digits once separators are removed is only lowercased.
pub fn format_mac(raw: &str) -> String {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();

    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return raw.trim().to_ascii_lowercase();
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
} // }}}

/// HTTP client for the controller's register CGI endpoints.
///
/// Every request is split into batches of at most [`MAX_BATCH_SIZE`] tags and
/// each batch is retried on its own according to the [`RetryPolicy`]. The
/// client holds no mutable state; cloning it is cheap.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    device_id: u32,
    credentials: Option<(String, String)>,
    retry: RetryPolicy,
    batch_size: usize,
    params: Arc<ParamMap>,
}

impl Client {
    pub fn new(
        base_url: &str,
        device_id: u32,
        credentials: Option<(String, String)>,
        timeout: Duration,
        retry: RetryPolicy,
        params: ParamMap,
    ) -> Result<Self> {
        // fail early on a bad base url rather than on the first poll
        Url::parse(base_url).map_err(|err| anyhow!("invalid base url {}: {}", base_url, err))?;

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id,
            credentials,
            retry,
            batch_size: MAX_BATCH_SIZE,
            params: Arc::new(params),
        })
    }

    pub fn from_config(device: &config::Device, params: ParamMap) -> Result<Self> {
        Self::new(
            &device.base_url(),
            device.device_id(),
            device.credentials(),
            device.timeout(),
            device.retry_policy(),
            params,
        )
    }

    /// Caps the tags per request below [`MAX_BATCH_SIZE`], for controllers
    /// with a shorter query limit.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Reads `tags` from the device, one request per batch, in order.
    pub async fn fetch_registers(&self, tags: &[String]) -> DeviceResult<Vec<Register>> {
        self.read_batches(tags, |body| codec::parse_registers(body, &self.params))
            .await
    }

    /// Reads `tags` and returns their values exactly as the device spelled
    /// them.
    pub async fn fetch_register_values(&self, tags: &[String]) -> DeviceResult<HashMap<String, String>> {
        Ok(self
            .read_batches(tags, codec::parse_raw_values)
            .await?
            .into_iter()
            .collect())
    }

    /// Writes `pairs` (tag id, value). Returns one ack per tag the device
    /// answered for; callers must check each ack's status. Empty `pairs` send
    /// no request.
    pub async fn write_registers(&self, pairs: &[(String, String)]) -> DeviceResult<Vec<WriteAck>> {
        let mut acks = Vec::with_capacity(pairs.len());

        for chunk in batches(pairs, self.batch_size) {
            acks.extend(self.write_chunk(chunk).await?);
        }

        Ok(acks)
    }

    /// Reads the fixed identity registers. A reply that lacks any of them is
    /// a setup failure.
    pub async fn read_device_info(&self) -> DeviceResult<DeviceInfo> {
        let tags: Vec<String> = DEVICE_INFO_TAGS.iter().map(|t| t.to_string()).collect();
        let values = self.fetch_register_values(&tags).await?;

        DeviceInfo::from_values(&values)
    }

    async fn read_batches<T, F>(&self, tags: &[String], parse: F) -> DeviceResult<Vec<T>>
    where
        F: Fn(&str) -> DeviceResult<Vec<T>>,
    {
        let mut r = Vec::with_capacity(tags.len());

        for chunk in batches(tags, self.batch_size) {
            let url = self.read_url(chunk)?;
            debug!("reading {} tags from {}", chunk.len(), url);

            let body = self.get_with_retry(&url).await?;
            let parsed = parse(&body)?;
            trace!("device answered {} of {} tags", parsed.len(), chunk.len());
            r.extend(parsed);
        }

        Ok(r)
    }

    async fn write_chunk(&self, chunk: &[(String, String)]) -> DeviceResult<Vec<WriteAck>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.write_url(chunk)?;
        info!("writing {} tags to {}", chunk.len(), self.base_url);

        let body = self.get_with_retry(&url).await?;
        let written: HashMap<&str, &str> = chunk
            .iter()
            .map(|(tag, value)| (tag.as_str(), value.as_str()))
            .collect();

        let mut acks = codec::parse_write_acks(&body)?;
        for ack in acks.iter_mut() {
            ack.value = written.get(ack.tag_id.as_str()).map(|v| v.to_string());
        }

        Ok(acks)
    }

    async fn get_with_retry(&self, url: &Url) -> DeviceResult<String> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.get(url).await {
                Ok(body) => return Ok(body),
                Err(err @ Error::Authentication { .. }) => {
                    error!("{}: {} - check username and password", self.base_url, err);
                    return Err(err);
                }
                Err(err) if attempt >= attempts => {
                    error!("{}: request failed after {} attempt(s): {}", self.base_url, attempt, err);
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(
                        "{}: request failed (attempt {}/{}): {} - retrying in {:?}",
                        self.base_url, attempt, attempts, err, self.retry.retry_delay
                    );
                    tokio::time::sleep(self.retry.retry_delay).await;
                }
            }
        }
    }

    async fn get(&self, url: &Url) -> DeviceResult<String> {
        let mut request = self.http.get(url.clone());
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    fn endpoint(&self, path: &str) -> DeviceResult<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))?;
        url.query_pairs_mut()
            .append_pair("device", &self.device_id.to_string());
        Ok(url)
    }

    fn read_url(&self, tags: &[String]) -> DeviceResult<Url> {
        let mut url = self.endpoint(READ_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            for tag in tags {
                query.append_key_only(tag);
            }
        }
        Ok(url)
    }

    fn write_url(&self, pairs: &[(String, String)]) -> DeviceResult<Url> {
        let mut url = self.endpoint(WRITE_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            for (tag, value) in pairs {
                query.append_pair(tag, value);
            }
        }
        Ok(url)
    }
}

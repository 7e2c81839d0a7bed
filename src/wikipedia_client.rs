//! Wikipedia `pageimages` lookups and image downloads over blocking HTTP.

use std::io::Read;
use std::time::Duration;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::config::FetchConfig;

/// Title lookup failed before an answer could be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wikipedia_api_error:{kind}")]
pub struct LocatorError {
    pub kind: String,
}

impl LocatorError {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Image download failed at the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("http_error:{kind}")]
pub struct DownloadError {
    pub kind: String,
}

impl DownloadError {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Raw response body plus the declared `Content-Type`, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Resolves one page title to a direct image URL.
pub trait ImageLocator {
    /// `Ok(None)` means the page has no usable image, which is routine.
    fn locate(&self, title: &str) -> Result<Option<String>, LocatorError>;
}

pub trait ImageDownloader {
    fn download(&self, url: &str) -> Result<DownloadedImage, DownloadError>;
}

fn ureq_error_kind(error: &ureq::Error) -> String {
    match error {
        ureq::Error::Status(code, _) => format!("status_{code}"),
        ureq::Error::Transport(transport) => format!("{:?}", transport.kind()),
    }
}

/// `query.pages.*.<key>.source` of the first page that has one.
fn first_page_image_source(response: &Value, key: &str) -> Option<String> {
    let pages = response["query"]["pages"].as_object()?;
    pages
        .values()
        .filter_map(|page| page[key]["source"].as_str())
        .map(str::trim)
        .find(|source| !source.is_empty())
        .map(str::to_string)
}

fn api_error_code(response: &Value) -> Option<String> {
    response["error"]["code"]
        .as_str()
        .map(|code| format!("api_{code}"))
}

/// Blocking client for the Wikipedia action API and upload.wikimedia.org.
pub struct WikimediaClient {
    http_client: ureq::Agent,
    api_base_url: String,
    user_agent: String,
    accept_header: String,
    thumbnail_size_px: u32,
    max_download_bytes: u64,
}

impl WikimediaClient {
    pub fn new(config: &FetchConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .timeout_write(Duration::from_secs(config.read_timeout_secs))
            .build();

        Self {
            http_client,
            api_base_url: config.api_base_url.clone(),
            user_agent: config.user_agent.clone(),
            accept_header: config.accept_header.clone(),
            thumbnail_size_px: config.thumbnail_size_px,
            max_download_bytes: config.max_download_bytes,
        }
    }

    fn original_image_url(&self, title: &str) -> String {
        format!(
            "{}?action=query&format=json&prop=pageimages&piprop=original&redirects=1&\
             origin=*&titles={}",
            self.api_base_url,
            urlencoding::encode(title)
        )
    }

    fn thumbnail_image_url(&self, title: &str) -> String {
        format!(
            "{}?action=query&format=json&prop=pageimages&piprop=thumbnail&pithumbsize={}&\
             redirects=1&origin=*&titles={}",
            self.api_base_url,
            self.thumbnail_size_px,
            urlencoding::encode(title)
        )
    }

    fn http_get_json(&self, url: &str) -> Result<Value, LocatorError> {
        let response = self
            .http_client
            .get(url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "application/json")
            .call()
            .map_err(|error| LocatorError::new(ureq_error_kind(&error)))?;
        let mut body = String::new();
        response
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|_| LocatorError::new("BodyRead"))?;
        let parsed: Value =
            serde_json::from_str(&body).map_err(|_| LocatorError::new("InvalidJson"))?;
        match api_error_code(&parsed) {
            Some(code) => Err(LocatorError::new(code)),
            None => Ok(parsed),
        }
    }
}

impl ImageLocator for WikimediaClient {
    fn locate(&self, title: &str) -> Result<Option<String>, LocatorError> {
        let original = self.http_get_json(&self.original_image_url(title))?;
        if let Some(source) = first_page_image_source(&original, "original") {
            debug!("Original image found. title={title} url={source}");
            return Ok(Some(source));
        }

        let thumbnail = self.http_get_json(&self.thumbnail_image_url(title))?;
        let source = first_page_image_source(&thumbnail, "thumbnail");
        match &source {
            Some(url) => debug!("Thumbnail image found. title={title} url={url}"),
            None => debug!("No page image. title={title}"),
        }
        Ok(source)
    }
}

impl ImageDownloader for WikimediaClient {
    fn download(&self, url: &str) -> Result<DownloadedImage, DownloadError> {
        let response = self
            .http_client
            .get(url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", &self.accept_header)
            .call()
            .map_err(|error| DownloadError::new(ureq_error_kind(&error)))?;
        let content_type = response
            .header("Content-Type")
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());

        let declared_len = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        if declared_len.is_some_and(|len| len > self.max_download_bytes) {
            return Err(DownloadError::new("TooLarge"));
        }

        // One byte past the cap tells a body that fits from one that was cut.
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(self.max_download_bytes.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|_| DownloadError::new("BodyRead"))?;
        if bytes.len() as u64 > self.max_download_bytes {
            return Err(DownloadError::new("TooLarge"));
        }
        debug!(
            "Downloaded image. url={url} bytes={} content_type={}",
            bytes.len(),
            content_type.as_deref().unwrap_or("-")
        );
        Ok(DownloadedImage {
            bytes,
            content_type,
        })
    }
}

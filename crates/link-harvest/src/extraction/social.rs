//! Social media link extraction from a domain's landing page

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{ExtractionConfig, PlatformConfig};
use crate::error::{Error, Result};
use crate::types::{InputRecord, ResultRecord};

use super::{ItemProcessor, ProcessError};

/// Fetches `http(s)://<domain>` and records the first link found for each platform
pub struct SocialLinkExtractor {
    client: reqwest::Client,
    platforms: Vec<PlatformConfig>,
    attributes: Vec<String>,
}

impl SocialLinkExtractor {
    /// Create an extractor; `timeout` bounds each page fetch
    pub fn new(config: &ExtractionConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            attributes: config.platforms.iter().map(|p| p.name.clone()).collect(),
            platforms: config.platforms.clone(),
        })
    }
}

#[async_trait]
impl ItemProcessor for SocialLinkExtractor {
    fn attributes(&self) -> &[String] {
        &self.attributes
    }

    async fn process(&self, record: &InputRecord) -> std::result::Result<ResultRecord, ProcessError> {
        let url = normalize_url(&record.key)
            .ok_or_else(|| ProcessError::Permanent("empty domain".to_string()))?;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProcessError::Recoverable(format!("Failed to fetch {}: {}", url, e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| ProcessError::Recoverable(format!("Failed to read {}: {}", url, e)))?;

        let links = extract_links(&body, &self.platforms)?;

        let mut result = ResultRecord::new(record.key.clone());
        result.values = links;
        Ok(result)
    }

    fn name(&self) -> &str {
        "social-links"
    }
}

/// Prefix `http://` when the domain carries no scheme. `None` for a blank key.
pub fn normalize_url(domain: &str) -> Option<String> {
    let domain = domain.trim();
    if domain.is_empty() {
        return None;
    }
    if domain.starts_with("http") {
        Some(domain.to_string())
    } else {
        Some(format!("http://{}", domain))
    }
}

/// Scan every `<a href>` in document order; the first href containing any of a
/// platform's patterns wins for that platform.
pub fn extract_links(
    html: &str,
    platforms: &[PlatformConfig],
) -> std::result::Result<BTreeMap<String, Option<String>>, ProcessError> {
    let anchors = Selector::parse("a[href]")
        .map_err(|e| ProcessError::Fatal(format!("Invalid anchor selector: {:?}", e)))?;
    let document = Html::parse_document(html);

    let mut links: BTreeMap<String, Option<String>> =
        platforms.iter().map(|p| (p.name.clone(), None)).collect();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };

        for platform in platforms {
            let slot = links.entry(platform.name.clone()).or_insert(None);
            if slot.is_none() && platform.patterns.iter().any(|p| href.contains(p.as_str())) {
                *slot = Some(href.to_string());
            }
        }

        if links.values().all(Option::is_some) {
            break;
        }
    }

    Ok(links)
}

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// One item of a polled feed. Lives only for the duration of a poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub title: String,
    /// Canonical article link; the identity key for the rest of the pipeline.
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub image_url: Option<String>,
}

impl FeedItem {
    pub fn from_rss_item(item: &rss::Item) -> Self {
        let published_at = item
            .pub_date()
            .and_then(parse_date)
            .or_else(|| {
                item.dublin_core_ext()
                    .and_then(|dc| dc.dates().first().and_then(|d| parse_date(d)))
            })
            .unwrap_or_else(Utc::now);

        Self {
            title: item.title().unwrap_or_default().trim().to_owned(),
            link: item.link().unwrap_or_default().trim().to_owned(),
            published_at,
            image_url: image_of(item),
        }
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .or_else(|_| DateTime::parse_from_rfc3339(value.trim()))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// enclosure, then media:content, then media:thumbnail
fn image_of(item: &rss::Item) -> Option<String> {
    if let Some(enclosure) = item.enclosure() {
        if enclosure.mime_type().starts_with("image/") && !enclosure.url().is_empty() {
            return Some(enclosure.url().to_owned());
        }
    }

    let media = item.extensions().get("media")?;
    ["content", "thumbnail"].iter().find_map(|name| {
        media
            .get(*name)?
            .iter()
            .find_map(|ext| ext.attrs().get("url").filter(|u| !u.is_empty()).cloned())
    })
}

/// Fetch and parse one RSS source. Items without a link are dropped; the
/// document order is kept.
pub async fn fetch_feed(client: &Client, url: &str) -> Result<Vec<FeedItem>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(IngestError::HttpStatus {
            url: url.to_owned(),
            status: status.as_u16(),
        });
    }
    let bytes = response.bytes().await?;
    let channel = rss::Channel::read_from(&bytes[..])?;

    Ok(channel
        .items()
        .iter()
        .map(FeedItem::from_rss_item)
        .filter(|item| !item.link.is_empty())
        .collect())
}

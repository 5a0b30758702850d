use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::record::RawEntry;
use crate::youtube::{self, YtDlp};

const DATA_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
/// Largest page the Data API hands out.
pub const PAGE_SIZE: u32 = 50;

/// Feeds backed by a [`crate::cache::TimedCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Home,
    Subscriptions,
}

impl Feed {
    pub fn name(self) -> &'static str {
        match self {
            Feed::Home => "home feed",
            Feed::Subscriptions => "subscriptions feed",
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<RawEntry>,
    pub next_page_token: Option<String>,
}

/// Remote metadata provider
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn search(&self, query: &str) -> GatewayResult<Vec<RawEntry>>;

    async fn list_feed(&self, feed: Feed) -> GatewayResult<Vec<RawEntry>>;

    /// Fails with [`GatewayError::MetadataNotFound`] when the id is unknown.
    async fn get_by_id(&self, id: &str) -> GatewayResult<RawEntry>;

    async fn list_playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> GatewayResult<Page>;

    /// Playlists owned by the configured channel.
    async fn list_collections(&self) -> GatewayResult<Vec<RawEntry>>;
}

/// YouTube through yt-dlp (feeds, search) and the Data API (lookups, playlists)
pub struct YoutubeCatalog {
    ytdlp: YtDlp,
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    channel_id: Option<String>,
}

impl YoutubeCatalog {
    pub fn new(ytdlp: YtDlp, api_key: Option<String>, channel_id: Option<String>) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            ytdlp,
            http,
            api_base: DATA_API_BASE.to_string(),
            api_key,
            channel_id,
        })
    }

    fn api_key(&self) -> GatewayResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Provider("YOUTUBE_API_KEY is not configured".into()))
    }

    async fn data_api(&self, resource: &str, params: &[(&str, &str)]) -> GatewayResult<Value> {
        let key = self.api_key()?;
        let url = format!("{}/{}", self.api_base, resource);
        let response = self
            .http
            .get(&url)
            .query(&[("part", "snippet"), ("key", key)])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider(format!(
                "YouTube API {} returned {}: {}",
                resource,
                status,
                crate::utils::preview(body.trim(), 300)
            )));
        }

        Ok(response.json().await?)
    }

    async fn flat_listing(&self, args: Vec<String>) -> GatewayResult<Vec<RawEntry>> {
        let dump = self.ytdlp.dump_json(&args).await?;
        entries_of(dump)
    }
}

#[async_trait]
impl Catalog for YoutubeCatalog {
    async fn search(&self, query: &str) -> GatewayResult<Vec<RawEntry>> {
        self.flat_listing(youtube::search_args(query)).await
    }

    async fn list_feed(&self, feed: Feed) -> GatewayResult<Vec<RawEntry>> {
        let args = match feed {
            Feed::Home => youtube::flat_listing_args(youtube::HOME_FEED_URL),
            Feed::Subscriptions => youtube::subscriptions_args(),
        };
        self.flat_listing(args).await
    }

    async fn get_by_id(&self, id: &str) -> GatewayResult<RawEntry> {
        if self.api_key.is_none() {
            return self.ytdlp.dump_json(&youtube::info_args(id)).await.map_err(|e| {
                // yt-dlp reports unavailable videos through its exit code
                GatewayError::MetadataNotFound(format!("Video not found: {}", e))
            });
        }

        let body = self.data_api("videos", &[("id", id)]).await?;
        items_of(body)
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::MetadataNotFound("Video not found".into()))
    }

    async fn list_playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> GatewayResult<Page> {
        let page_size = PAGE_SIZE.to_string();
        let mut params = vec![("playlistId", playlist_id), ("maxResults", page_size.as_str())];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let body = self.data_api("playlistItems", &params).await?;
        let next_page_token = body
            .get("nextPageToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(Page {
            entries: items_of(body),
            next_page_token,
        })
    }

    async fn list_collections(&self) -> GatewayResult<Vec<RawEntry>> {
        let channel = self
            .channel_id
            .as_deref()
            .ok_or_else(|| GatewayError::Provider("YOUTUBE_CHANNEL_ID is not configured".into()))?;
        let page_size = PAGE_SIZE.to_string();
        let body = self
            .data_api("playlists", &[("channelId", channel), ("maxResults", page_size.as_str())])
            .await?;
        Ok(items_of(body))
    }
}

/// `entries` of a yt-dlp flat dump
fn entries_of(mut dump: Value) -> GatewayResult<Vec<RawEntry>> {
    match dump.get_mut("entries").map(Value::take) {
        Some(Value::Array(entries)) => Ok(entries),
        _ => Err(GatewayError::Provider("No entries found".into())),
    }
}

/// `items` of a Data API response; absent means empty
fn items_of(mut body: Value) -> Vec<RawEntry> {
    match body.get_mut("items").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

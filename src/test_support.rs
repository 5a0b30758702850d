//! In-process stand-ins for the clock, the catalog and the acquisition tool.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

use crate::cache::Clock;
use crate::catalog::{Catalog, Feed, Page};
use crate::downloader::{Acquirer, Acquisition};
use crate::error::{GatewayError, GatewayResult};
use crate::record::RawEntry;

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Canned catalog. Playlist pages set to `None` fail when requested.
#[derive(Default)]
pub struct FakeCatalog {
    videos: HashMap<String, RawEntry>,
    feed: Vec<RawEntry>,
    search: Vec<RawEntry>,
    playlists: HashMap<String, Vec<Option<Vec<RawEntry>>>>,
    collections: Vec<RawEntry>,
    feeds_down: AtomicBool,
    feed_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn with_video(mut self, raw: RawEntry) -> Self {
        let id = raw["id"].as_str().unwrap().to_string();
        self.videos.insert(id, raw);
        self
    }

    pub fn with_feed(mut self, entries: Vec<RawEntry>) -> Self {
        self.feed = entries;
        self
    }

    pub fn with_search(mut self, entries: Vec<RawEntry>) -> Self {
        self.search = entries;
        self
    }

    pub fn with_playlist(mut self, id: &str, pages: Vec<Option<Vec<RawEntry>>>) -> Self {
        self.playlists.insert(id.to_string(), pages);
        self
    }

    pub fn with_collections(mut self, entries: Vec<RawEntry>) -> Self {
        self.collections = entries;
        self
    }

    pub fn set_feeds_down(&self, down: bool) {
        self.feeds_down.store(down, Ordering::SeqCst);
    }

    pub fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn search(&self, _query: &str) -> GatewayResult<Vec<RawEntry>> {
        Ok(self.search.clone())
    }

    async fn list_feed(&self, _feed: Feed) -> GatewayResult<Vec<RawEntry>> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        if self.feeds_down.load(Ordering::SeqCst) {
            return Err(GatewayError::Provider("feed unavailable".into()));
        }
        Ok(self.feed.clone())
    }

    async fn get_by_id(&self, id: &str) -> GatewayResult<RawEntry> {
        self.videos
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::MetadataNotFound("Video not found".into()))
    }

    async fn list_playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> GatewayResult<Page> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let Some(pages) = self.playlists.get(playlist_id) else {
            return Ok(Page::default());
        };
        let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let entries = pages[index]
            .clone()
            .ok_or_else(|| GatewayError::Provider(format!("page {} unavailable", index)))?;

        Ok(Page {
            entries,
            next_page_token: (index + 1 < pages.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn list_collections(&self) -> GatewayResult<Vec<RawEntry>> {
        Ok(self.collections.clone())
    }
}

/// Hands out one prepared acquisition, or refuses to spawn.
pub struct FakeAcquirer {
    prepared: Mutex<Option<Acquisition>>,
    calls: AtomicUsize,
}

impl FakeAcquirer {
    pub fn once(acquisition: Acquisition) -> Self {
        Self {
            prepared: Mutex::new(Some(acquisition)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            prepared: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Acquirer for FakeAcquirer {
    fn acquire(&self, _video_id: &str) -> GatewayResult<Acquisition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prepared
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| GatewayError::Acquisition("Failed to spawn yt-dlp: not found".into()))
    }
}

/// Emits `output` at once, then exits with `exit`.
pub fn scripted_acquisition(output: Vec<u8>, exit: GatewayResult<()>) -> Acquisition {
    Acquisition {
        output: Box::new(Cursor::new(output)),
        exit: async move { exit }.boxed(),
    }
}

/// Output written by the test through the returned pipe; the process
/// "exits" when the sender fires.
pub fn gated_acquisition() -> (Acquisition, DuplexStream, oneshot::Sender<GatewayResult<()>>) {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = oneshot::channel();
    let acquisition = Acquisition {
        output: Box::new(reader),
        exit: async move {
            exit_rx
                .await
                .unwrap_or_else(|_| Err(GatewayError::Acquisition("killed".into())))
        }
        .boxed(),
    };
    (acquisition, writer, exit_tx)
}

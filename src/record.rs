//! Canonical catalog records and the normalizer that builds them.
//!
//! Provider payloads arrive in several shapes: flat yt-dlp entries
//! (`id`, `title`, `thumbnails[]`/`thumbnail`), Data API video and playlist
//! resources (`id`, `snippet.title`, `snippet.thumbnails.{medium,default}`)
//! and playlist items (`snippet.resourceId.videoId`). [`Record::from_raw`]
//! tries all of them and falls back to [`PLACEHOLDER_THUMBNAIL`] whenever a
//! thumbnail is missing at any level.

use serde::ser::{Serialize, Serializer};
use serde_json::Value;

/// Shared image served when an item has no thumbnail of its own.
pub const PLACEHOLDER_THUMBNAIL: &str = "/img/no_thumbnail.jpg";

/// Longest title (in characters) allowed as a file name stem.
pub const MAX_TITLE_CHARS: usize = 200;

const PATH_HOSTILE: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Raw provider payload; its shape is provider-defined.
pub type RawEntry = Value;

/// One video as the gateway sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub thumbnail_url: String,
}

/// A playlist; serialized with a flat `id` unlike [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection(pub Record);

impl Record {
    pub fn new(id: impl Into<String>, title: impl Into<String>, thumbnail_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            thumbnail_url: thumbnail_url.into(),
        }
    }

    /// Returns `None` when no identifier can be found in the payload.
    pub fn from_raw(raw: &RawEntry) -> Option<Self> {
        let id = raw_id(raw)?;
        let title = first_str(raw, &[&["title"], &["snippet", "title"]])
            .unwrap_or_default()
            .to_string();
        let thumbnail_url = raw_thumbnail(raw)
            .unwrap_or(PLACEHOLDER_THUMBNAIL)
            .to_string();

        Some(Self {
            id,
            title,
            thumbnail_url,
        })
    }

    /// Title made safe for use as a file name stem; falls back to the id.
    pub fn file_stem(&self) -> String {
        let stem = sanitize_title(&self.title);
        if stem.is_empty() {
            sanitize_title(&self.id)
        } else {
            stem
        }
    }
}

/// Normalizes a list of raw entries, skipping the ones without an id.
pub fn normalize_all(entries: &[RawEntry]) -> Vec<Record> {
    entries.iter().filter_map(Record::from_raw).collect()
}

/// Strips path-hostile characters and bounds the length. Leading dots go
/// too: dot files are reserved for in-progress downloads.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !PATH_HOSTILE.contains(c) && !c.is_control())
        .collect();
    let bounded: String = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    bounded.trim_end().to_string()
}

fn raw_id(raw: &RawEntry) -> Option<String> {
    let candidates: &[&[&str]] = &[
        &["snippet", "resourceId", "videoId"],
        &["id", "videoId"],
        &["id"],
    ];
    first_str(raw, candidates)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn raw_thumbnail(raw: &RawEntry) -> Option<&str> {
    let candidates: &[&[&str]] = &[
        &["snippet", "thumbnails", "medium", "url"],
        &["snippet", "thumbnails", "default", "url"],
        &["thumbnail"],
    ];
    let from_list = raw
        .get("thumbnails")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|first| first.get("url"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty());

    // flat entries carry their list first, then the single field
    from_list
        .or_else(|| first_str(raw, &candidates[..2]))
        .or_else(|| first_str(raw, &candidates[2..]))
}

fn first_str<'a>(raw: &'a RawEntry, candidates: &[&[&str]]) -> Option<&'a str> {
    candidates.iter().find_map(|path| {
        path.iter()
            .try_fold(raw, |node, key| node.get(*key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    })
}

#[derive(serde::Serialize)]
struct WireThumbnail<'a> {
    url: &'a str,
}

#[derive(serde::Serialize)]
struct WireThumbnails<'a> {
    medium: WireThumbnail<'a>,
}

#[derive(serde::Serialize)]
struct WireSnippet<'a> {
    title: &'a str,
    thumbnails: WireThumbnails<'a>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct WireVideoId<'a> {
    video_id: &'a str,
}

#[derive(serde::Serialize)]
struct WireRecord<'a, I> {
    id: I,
    snippet: WireSnippet<'a>,
}

impl Record {
    fn snippet(&self) -> WireSnippet<'_> {
        WireSnippet {
            title: &self.title,
            thumbnails: WireThumbnails {
                medium: WireThumbnail {
                    url: &self.thumbnail_url,
                },
            },
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireRecord {
            id: WireVideoId { video_id: &self.id },
            snippet: self.snippet(),
        }
        .serialize(serializer)
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireRecord {
            id: self.0.id.as_str(),
            snippet: self.0.snippet(),
        }
        .serialize(serializer)
    }
}

use std::io::ErrorKind;
use std::path::Path;

use crate::error::{GatewayError, GatewayResult};
use crate::paths::{PathConfig, ARTIFACT_EXTENSION, THUMBNAIL_EXTENSION};
use crate::record::{Record, PLACEHOLDER_THUMBNAIL};
use crate::log_warn;

/// Seek offset appended to an artifact URL so the player shows a frame.
const FRAME_OFFSET_FRAGMENT: &str = "#t=0.1";

/// Completed artifacts on disk, as records
pub struct LocalLibrary {
    paths: PathConfig,
}

impl LocalLibrary {
    pub fn new(paths: PathConfig) -> Self {
        Self { paths }
    }

    /// Sorted by file name. A missing artifact directory reads as empty.
    pub async fn list_local(&self) -> GatewayResult<Vec<Record>> {
        let dir = &self.paths.artifact_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GatewayError::filesystem(dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GatewayError::filesystem(dir, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && is_artifact_name(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let title = name
                .strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))
                .unwrap_or(&name)
                .to_string();
            let thumbnail_url = self.thumbnail_for(&name, &title).await;
            records.push(Record::new(urlencoding::encode(&name), title, thumbnail_url));
        }
        Ok(records)
    }

    /// Companion image, else a frame of the artifact itself, else the placeholder.
    async fn thumbnail_for(&self, file_name: &str, title: &str) -> String {
        match self.resolve_thumbnail(file_name, title).await {
            Ok(url) => url,
            Err(e) => {
                log_warn!("Thumbnail lookup failed for {}: {}", file_name, e);
                PLACEHOLDER_THUMBNAIL.to_string()
            }
        }
    }

    async fn resolve_thumbnail(&self, file_name: &str, title: &str) -> std::io::Result<String> {
        if tokio::fs::try_exists(self.paths.thumbnail_path(title)).await? {
            return Ok(format!(
                "/img/{}.{}",
                urlencoding::encode(title),
                THUMBNAIL_EXTENSION
            ));
        }

        // an empty artifact has no frame to show
        let artifact = self.paths.artifact_dir.join(file_name);
        if non_empty_file(&artifact).await? {
            return Ok(format!(
                "/downloads/{}{}",
                urlencoding::encode(file_name),
                FRAME_OFFSET_FRAGMENT
            ));
        }

        Ok(PLACEHOLDER_THUMBNAIL.to_string())
    }
}

fn is_artifact_name(name: &str) -> bool {
    !name.starts_with('.')
        && Path::new(name)
            .extension()
            .map(|ext| ext == ARTIFACT_EXTENSION)
            .unwrap_or(false)
}

async fn non_empty_file(path: &Path) -> std::io::Result<bool> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.is_file() && metadata.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> (tempfile::TempDir, PathConfig, LocalLibrary) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(dir.path());
        paths.ensure_directories_exist().unwrap();
        let library = LocalLibrary::new(paths.clone());
        (dir, paths, library)
    }

    #[tokio::test]
    async fn lists_song_with_placeholder_when_nothing_to_show() {
        let (_dir, paths, library) = library();
        std::fs::write(paths.artifact_dir.join("Song.mp4"), b"").unwrap();

        let records = library.list_local().await.unwrap();
        assert_eq!(records, vec![Record::new("Song.mp4", "Song", PLACEHOLDER_THUMBNAIL)]);
    }

    #[tokio::test]
    async fn prefers_companion_image_then_artifact_frame() {
        let (_dir, paths, library) = library();
        std::fs::write(paths.artifact_dir.join("My Song.mp4"), b"movie").unwrap();
        std::fs::write(paths.artifact_dir.join("Other.mp4"), b"movie").unwrap();
        std::fs::write(paths.thumbnail_path("My Song"), b"jpeg").unwrap();

        let records = library.list_local().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "My%20Song.mp4");
        assert_eq!(records[0].title, "My Song");
        assert_eq!(records[0].thumbnail_url, "/img/My%20Song.jpg");
        assert_eq!(records[1].thumbnail_url, "/downloads/Other.mp4#t=0.1");
    }

    #[tokio::test]
    async fn skips_other_extensions_and_part_files() {
        let (_dir, paths, library) = library();
        std::fs::write(paths.artifact_dir.join("notes.txt"), b"x").unwrap();
        std::fs::write(paths.part_path("Song", 3), b"partial").unwrap();
        std::fs::create_dir(paths.artifact_dir.join("folder.mp4")).unwrap();
        std::fs::write(paths.artifact_dir.join("Kept.mp4"), b"x").unwrap();

        let titles: Vec<_> = library
            .list_local()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["Kept"]);
    }

    #[tokio::test]
    async fn dotted_titles_are_listed_after_download() {
        let (_dir, paths, library) = library();
        let stem = Record::new("x", "...Baby One More Time", "").file_stem();
        std::fs::write(paths.artifact_path(&stem), b"movie").unwrap();

        let records = library.list_local().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Baby One More Time");
        assert_eq!(records[0].id, "Baby%20One%20More%20Time.mp4");
    }

    #[tokio::test]
    async fn missing_directory_is_an_empty_library() {
        let dir = tempfile::tempdir().unwrap();
        let library = LocalLibrary::new(PathConfig::new(dir.path().join("nowhere")));
        assert!(library.list_local().await.unwrap().is_empty());
    }
}

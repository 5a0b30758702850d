use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::{log_debug, log_warn};

/// Spawns a background task that forwards a diagnostic stream to the logger line by line
pub fn spawn_logger<R>(stdio: R, label: String)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdio).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) if is_notable_diagnostic(&line) => log_warn!("[{}] {}", label, line),
                Ok(Some(line)) => log_debug!("[{}] {}", label, line),
                Ok(None) => break,
                Err(e) => {
                    log_warn!("[{}] diagnostic stream unreadable: {}", label, e);
                    break;
                }
            }
        }
    });
}

/// yt-dlp prefixes real problems; everything else is progress chatter.
fn is_notable_diagnostic(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("ERROR:") || line.starts_with("WARNING:")
}

/// Accepts a single path component with no traversal or separators
pub fn is_safe_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

/// Truncates long identifiers or URLs for log lines
pub fn preview(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_segments() {
        assert!(is_safe_path_segment("Song.mp4"));
        assert!(is_safe_path_segment("My Song (live).mp4"));
        assert!(!is_safe_path_segment(".."));
        assert!(!is_safe_path_segment("../secret"));
        assert!(!is_safe_path_segment("a\\b"));
        assert!(!is_safe_path_segment(""));
    }

    #[test]
    fn only_errors_and_warnings_are_notable() {
        assert!(is_notable_diagnostic("ERROR: [youtube] abc: Video unavailable"));
        assert!(is_notable_diagnostic("WARNING: unable to extract uploader"));
        assert!(!is_notable_diagnostic("[download]  12.3% of ~ 40.00MiB at 2.1MiB/s ETA 00:16"));
        assert!(!is_notable_diagnostic("[youtube] Extracting URL: https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo world", 5), "héllo");
        assert_eq!(preview("short", 50), "short");
    }
}

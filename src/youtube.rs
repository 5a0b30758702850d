use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::downloader::{Acquirer, Acquisition};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::spawn_logger;
use crate::log_debug;

pub const WATCH_URL: &str = "https://www.youtube.com/watch?v=";
pub const HOME_FEED_URL: &str = "https://www.youtube.com/";
pub const SUBSCRIPTIONS_FEED_URL: &str = "https://www.youtube.com/feed/subscriptions";

const SEARCH_RESULTS: u32 = 20;
const SUBSCRIPTIONS_LIMIT: u32 = 100;
const REFERER_HEADER: &str = "referer:youtube.com";
const USER_AGENT_HEADER: &str = "user-agent:Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
/// Best single-file mp4, else whatever is best.
const STREAM_FORMAT: &str = "best[ext=mp4]/best";

/// Return the yt-dlp executable: explicit path, then resources/bin, then PATH
fn resolve_ytdlp_exe(explicit: Option<&Path>, root: &Path) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let bin = root.join("resources").join("bin");
    let candidate = if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    };
    let p = bin.join(candidate);
    if p.exists() {
        return p;
    }
    PathBuf::from(candidate)
}

/// Handle on the external yt-dlp tool
#[derive(Clone, Debug)]
pub struct YtDlp {
    exe: PathBuf,
    cookie_file: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(explicit: Option<&Path>, root: &Path, cookie_file: &Path) -> Self {
        Self {
            exe: resolve_ytdlp_exe(explicit, root),
            // yt-dlp refuses to start when handed a missing cookie jar
            cookie_file: cookie_file.exists().then(|| cookie_file.to_path_buf()),
        }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.stdin(Stdio::null());
        if let Some(cookies) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookies);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd
    }

    /// Runs yt-dlp to completion and parses its JSON stdout
    pub async fn dump_json(&self, args: &[String]) -> GatewayResult<serde_json::Value> {
        log_debug!("yt-dlp {}", args.join(" "));
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| GatewayError::Provider(format!("Failed to run yt-dlp: {}", e)))?;

        if !output.status.success() {
            return Err(GatewayError::Provider(format!(
                "yt-dlp exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| GatewayError::Provider(format!("Bad yt-dlp JSON: {}", e)))
    }

    /// Spawns a streaming download of one video to stdout
    pub fn spawn_stream(&self, video_id: &str) -> std::io::Result<Child> {
        self.command()
            .args(stream_args(video_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // a departed viewer must not take the download with it
            .kill_on_drop(false)
            .spawn()
    }
}

impl Acquirer for YtDlp {
    fn acquire(&self, video_id: &str) -> GatewayResult<Acquisition> {
        let mut child = self
            .spawn_stream(video_id)
            .map_err(|e| GatewayError::Acquisition(format!("Failed to spawn yt-dlp: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Acquisition("yt-dlp stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_logger(stderr, format!("yt-dlp {}", video_id));
        }

        let exit = async move {
            let status = child
                .wait()
                .await
                .map_err(|e| GatewayError::Acquisition(format!("Failed to wait for yt-dlp: {}", e)))?;
            if status.success() {
                Ok(())
            } else {
                Err(GatewayError::Acquisition(format!("yt-dlp exit {}", status)))
            }
        }
        .boxed();

        Ok(Acquisition {
            output: Box::new(stdout),
            exit,
        })
    }
}

pub fn watch_url(video_id: &str) -> String {
    format!("{}{}", WATCH_URL, video_id)
}

/// Flat single-JSON listing of a feed or search target
pub fn flat_listing_args(target: &str) -> Vec<String> {
    vec![
        "--flat-playlist".into(),
        "--dump-single-json".into(),
        target.into(),
    ]
}

pub fn search_args(query: &str) -> Vec<String> {
    flat_listing_args(&format!("ytsearch{}:{}", SEARCH_RESULTS, query))
}

pub fn subscriptions_args() -> Vec<String> {
    let mut args = vec![
        "--playlist-end".to_string(),
        SUBSCRIPTIONS_LIMIT.to_string(),
        "--skip-download".into(),
        "--no-check-certificates".into(),
        "--no-warnings".into(),
        "--add-header".into(),
        REFERER_HEADER.into(),
        "--add-header".into(),
        USER_AGENT_HEADER.into(),
    ];
    args.extend(flat_listing_args(SUBSCRIPTIONS_FEED_URL));
    args
}

/// Full JSON info for one video (`yt-dlp -j`)
pub fn info_args(video_id: &str) -> Vec<String> {
    vec!["-j".into(), "--no-playlist".into(), watch_url(video_id)]
}

pub fn stream_args(video_id: &str) -> Vec<String> {
    vec![
        "--format".into(),
        STREAM_FORMAT.into(),
        "--output".into(),
        "-".into(),
        "--merge-output-format".into(),
        "mp4".into(),
        "--no-playlist".into(),
        "--no-check-certificates".into(),
        "--no-warnings".into(),
        "--no-part".into(),
        "--add-header".into(),
        REFERER_HEADER.into(),
        "--add-header".into(),
        USER_AGENT_HEADER.into(),
        watch_url(video_id),
    ]
}

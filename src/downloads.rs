use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// Progress of a single session (keyed by session number)
pub struct SessionControl {
    video_id: String,
    title: String,
    started_at: DateTime<Utc>,
    bytes_written: AtomicU64,
    live_attached: AtomicBool,
}

impl SessionControl {
    fn new(video_id: &str, title: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            title: title.to_string(),
            started_at: Utc::now(),
            bytes_written: AtomicU64::new(0),
            live_attached: AtomicBool::new(true),
        }
    }

    pub fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_written.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn detach_live(&self) {
        self.live_attached.store(false, Ordering::SeqCst);
    }

    pub fn live_attached(&self) -> bool {
        self.live_attached.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InflightStatus {
    pub session: u64,
    pub video_id: String,
    pub title: String,
    pub bytes_written: u64,
    pub live_attached: bool,
    pub started_at: DateTime<Utc>,
}

/// Sessions currently pumping process output
#[derive(Default)]
pub struct InflightRegistry {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<SessionControl>>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a session number and starts tracking it
    pub fn register(&self, video_id: &str, title: &str) -> (u64, Arc<SessionControl>) {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let control = Arc::new(SessionControl::new(video_id, title));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, Arc::clone(&control));
        (session, control)
    }

    pub fn clear(&self, session: u64) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<InflightStatus> {
        let guard = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<InflightStatus> = guard
            .iter()
            .map(|(session, ctrl)| InflightStatus {
                session: *session,
                video_id: ctrl.video_id.clone(),
                title: ctrl.title.clone(),
                bytes_written: ctrl.bytes_written(),
                live_attached: ctrl.live_attached(),
                started_at: ctrl.started_at,
            })
            .collect();
        list.sort_by_key(|s| s.session);
        list
    }
}

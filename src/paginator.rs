use crate::catalog::Catalog;
use crate::record::{normalize_all, Record};
use crate::{log_info, log_warn};

/// Every item of a playlist, in page order.
///
/// Follows continuation tokens until the provider stops returning one. A
/// failing page ends the walk and whatever was gathered so far is returned.
pub async fn list_all(catalog: &dyn Catalog, playlist_id: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = match catalog.list_playlist_page(playlist_id, token.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                log_warn!(
                    "Playlist {} page {} failed, returning {} items: {}",
                    playlist_id,
                    pages + 1,
                    records.len(),
                    e
                );
                break;
            }
        };
        pages += 1;
        records.extend(normalize_all(&page.entries));

        match page.next_page_token {
            // a repeated token would loop forever
            Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
            _ => break,
        }
    }

    log_info!(
        "Playlist {}: {} items over {} pages",
        playlist_id,
        records.len(),
        pages
    );
    records
}

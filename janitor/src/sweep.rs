use std::time::Duration;

use common::{
    clock,
    db::{DbResult, Status, UploadRequest, UploadStore},
};
use log::{debug, warn};

pub struct SweepConfig {
    /// PROCESSING requests untouched for this long are failed.
    pub stalled_after: Duration,
    /// COMPLETED and FAILED requests untouched for this long are deleted.
    pub retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stalled_after: Duration::from_secs(1800),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stalled: usize,
    pub purged: usize,
    pub orphans: usize,
    /// Records that could not be handled this time round.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One maintenance pass over the upload collections.
///
/// Failures on individual records are logged and counted; only failing to
/// list candidates ends the pass early.
pub async fn sweep<S: UploadStore + ?Sized>(
    store: &S,
    config: &SweepConfig,
) -> DbResult<SweepReport> {
    let mut report = SweepReport::default();
    fail_stalled(store, config, &mut report).await?;
    purge_finished(store, config, &mut report).await?;
    remove_orphans(store, &mut report).await?;
    Ok(report)
}

async fn fail_stalled<S: UploadStore + ?Sized>(
    store: &S,
    config: &SweepConfig,
    report: &mut SweepReport,
) -> DbResult<()> {
    let cutoff = clock::before(store.now(), config.stalled_after);
    let message = format!(
        "Operation stalled - timeout after {} seconds",
        config.stalled_after.as_secs()
    );
    for mut request in store
        .find_by_status_updated_before(Status::Processing, cutoff)
        .await?
    {
        match request.fail(store, message.as_str()).await {
            Ok(true) => {
                warn!("upload request {} stalled, marked failed", request.id);
                report.stalled += 1;
            }
            // finished or cancelled since we listed it
            Ok(false) => {}
            Err(e) => {
                warn!("could not fail stalled upload request {}: {e}", request.id);
                report.errors += 1;
            }
        }
    }
    Ok(())
}

async fn purge_finished<S: UploadStore + ?Sized>(
    store: &S,
    config: &SweepConfig,
    report: &mut SweepReport,
) -> DbResult<()> {
    let cutoff = clock::before(store.now(), config.retention);
    for status in [Status::Completed, Status::Failed] {
        for request in store.find_by_status_updated_before(status, cutoff).await? {
            match purge(store, &request).await {
                Ok(()) => report.purged += 1,
                Err(e) => {
                    warn!("could not delete upload request {}: {e}", request.id);
                    report.errors += 1;
                }
            }
        }
    }
    Ok(())
}

// The request goes first; metadata left behind by a failure here is picked
// up as an orphan.
async fn purge<S: UploadStore + ?Sized>(store: &S, request: &UploadRequest) -> DbResult<()> {
    store.delete_upload_request(&request.id).await?;
    if store.delete_file_metadata(&request.id).await? {
        debug!("deleted file metadata of upload request {}", request.id);
    }
    Ok(())
}

async fn remove_orphans<S: UploadStore + ?Sized>(
    store: &S,
    report: &mut SweepReport,
) -> DbResult<()> {
    for id in store.file_metadata_request_ids().await? {
        let orphaned = match store.find_upload_request(&id).await {
            Ok(request) => request.is_none(),
            Err(e) => {
                warn!("could not look up upload request {id}: {e}");
                report.errors += 1;
                continue;
            }
        };
        if !orphaned {
            continue;
        }
        match store.delete_file_metadata(&id).await {
            Ok(true) => {
                debug!("deleted orphaned file metadata of upload request {id}");
                report.orphans += 1;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("could not delete orphaned file metadata of {id}: {e}");
                report.errors += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        clock::{Clock, ManualClock, SystemClock},
        db::{FileMetadata, MemoryStore, NewUpload},
        schema::UPLOAD_TTL,
    };

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn setup() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(SystemClock.now()));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    async fn request(store: &MemoryStore, upload_id: &str) -> UploadRequest {
        let upload = NewUpload {
            client_id: "client-a".to_string(),
            upload_id: upload_id.to_string(),
            original_filename: "a.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            file_size: 1,
            checksum: "ff".to_string(),
        };
        UploadRequest::create_or_get(store, upload)
            .await
            .unwrap()
            .into_request()
    }

    async fn completed(store: &MemoryStore, upload_id: &str) -> UploadRequest {
        let mut r = request(store, upload_id).await;
        assert!(r.acquire(store).await.unwrap());
        let meta = FileMetadata::new(&r, upload_id.to_string(), 1, "ff".to_string(), store.now());
        r.complete(store, &meta).await.unwrap();
        r
    }

    #[tokio::test]
    async fn stalled_uploads_are_failed() {
        let (clock, store) = setup();
        let mut stuck = request(&store, "stuck").await;
        assert!(stuck.acquire(&store).await.unwrap());
        clock.advance(HOUR);
        let mut fresh = request(&store, "fresh").await;
        assert!(fresh.acquire(&store).await.unwrap());

        let report = sweep(&store, &SweepConfig::default()).await.unwrap();
        assert_eq!(report.stalled, 1);

        let stuck = UploadRequest::from_database(&store, &stuck.id).await.unwrap();
        assert_eq!(stuck.status, Status::Failed);
        assert_eq!(
            stuck.error_message.as_deref(),
            Some("Operation stalled - timeout after 1800 seconds")
        );
        let fresh = UploadRequest::from_database(&store, &fresh.id).await.unwrap();
        assert_eq!(fresh.status, Status::Processing);
    }

    #[tokio::test]
    async fn old_finished_uploads_are_purged_with_their_metadata() {
        let (clock, store) = setup();
        let done = completed(&store, "done").await;
        let mut failed = request(&store, "failed").await;
        assert!(failed.acquire(&store).await.unwrap());
        assert!(failed.fail(&store, "broken pipe").await.unwrap());
        let pending = request(&store, "pending").await;

        clock.advance(31 * DAY);
        let recent = completed(&store, "recent").await;

        let report = sweep(&store, &SweepConfig::default()).await.unwrap();
        assert_eq!(report.purged, 2);
        assert_eq!(report.orphans, 0);
        assert!(store.find_upload_request(&done.id).await.unwrap().is_none());
        assert!(store.find_file_metadata(&done.id).await.unwrap().is_none());
        assert!(store.find_upload_request(&failed.id).await.unwrap().is_none());
        assert!(store.find_upload_request(&pending.id).await.unwrap().is_some());
        assert!(store.find_file_metadata(&recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn metadata_of_expired_requests_is_reclaimed() {
        let (clock, store) = setup();
        let config = SweepConfig {
            retention: 365 * DAY,
            ..SweepConfig::default()
        };
        common::db::apply_schema(
            &store,
            &common::config::Principal::with_default_name("fileUploader", "pw"),
        )
        .await
        .unwrap();
        let done = completed(&store, "done").await;

        clock.advance(UPLOAD_TTL + Duration::from_secs(1));
        assert_eq!(store.run_ttl_monitor(), 1);
        assert!(store.find_file_metadata(&done.id).await.unwrap().is_some());

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report.orphans, 1);
        assert!(store.find_file_metadata(&done.id).await.unwrap().is_none());
        assert!(sweep(&store, &config).await.unwrap().is_empty());
    }
}

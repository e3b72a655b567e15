use log::{debug, info, warn};

use super::{
    DbError, DbResult, FileMetadata, NewUpload, Status, Transition, UploadRequest, UploadStore,
};

#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    Created(UploadRequest),
    /// The client already started this upload; this is what was stored.
    Existing(UploadRequest),
}

impl CreateOutcome {
    pub fn request(&self) -> &UploadRequest {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn into_request(self) -> UploadRequest {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

impl UploadRequest {
    /// Returns the request stored for the client's upload id, recording a new
    /// PENDING one if there is none. Retried uploads therefore land on the
    /// same request.
    pub async fn create_or_get<S: UploadStore + ?Sized>(
        store: &S,
        upload: NewUpload,
    ) -> DbResult<CreateOutcome> {
        if let Some(existing) = store
            .find_by_client_and_upload_id(&upload.client_id, &upload.upload_id)
            .await?
        {
            debug!(
                "found upload request {} in status {}",
                existing.id, existing.status
            );
            return Ok(CreateOutcome::Existing(existing));
        }

        let request = UploadRequest::new(upload, store.now());
        match store.insert_upload_request(&request).await {
            Ok(()) => {
                info!(
                    "created upload request {} for client {}",
                    request.id, request.client_id
                );
                Ok(CreateOutcome::Created(request))
            }
            Err(DbError::DuplicateKey { .. }) => {
                // someone inserted the same (client, upload) pair in between
                warn!(
                    "concurrent creation for client {} upload {}",
                    request.client_id, request.upload_id
                );
                store
                    .find_by_client_and_upload_id(&request.client_id, &request.upload_id)
                    .await?
                    .map(CreateOutcome::Existing)
                    .ok_or(DbError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn from_database<S: UploadStore + ?Sized>(store: &S, id: &str) -> DbResult<Self> {
        store.find_upload_request(id).await?.ok_or(DbError::NotFound)
    }

    /// Claims the request for processing. `false` means another worker got
    /// there first or the request can no longer be retried.
    pub async fn acquire<S: UploadStore + ?Sized>(&mut self, store: &S) -> DbResult<bool> {
        self.change(store, Transition::Acquire).await
    }

    pub async fn fail<S: UploadStore + ?Sized>(
        &mut self,
        store: &S,
        error_message: impl Into<String>,
    ) -> DbResult<bool> {
        let transition = Transition::Fail {
            error_message: error_message.into(),
        };
        self.change(store, transition).await
    }

    pub async fn cancel<S: UploadStore + ?Sized>(&mut self, store: &S) -> DbResult<bool> {
        self.change(store, Transition::Cancel).await
    }

    /// Records the received file and marks the request COMPLETED.
    ///
    /// Metadata left behind by an earlier attempt that never completed is
    /// replaced. If the request is no longer PROCESSING the metadata is
    /// removed again and `DbError::WrongStatus` is returned with the status
    /// found.
    pub async fn complete<S: UploadStore + ?Sized>(
        &mut self,
        store: &S,
        metadata: &FileMetadata,
    ) -> DbResult<()> {
        if self.status != Status::Processing {
            return Err(DbError::WrongStatus(self.status));
        }
        match store.insert_file_metadata(metadata).await {
            Ok(()) => {}
            Err(DbError::DuplicateKey { .. }) => {
                warn!(
                    "replacing stale file metadata of upload request {}",
                    metadata.upload_request_id
                );
                store.delete_file_metadata(&metadata.upload_request_id).await?;
                store.insert_file_metadata(metadata).await?;
            }
            Err(e) => return Err(e),
        }

        let transition = Transition::Complete {
            file_metadata_id: metadata.id.clone(),
        };
        let changed = match self.change(store, transition).await {
            Ok(changed) => changed,
            Err(e) => {
                let cleanup = store.delete_file_metadata(&metadata.upload_request_id).await;
                if let Err(cleanup) = cleanup {
                    warn!("could not remove file metadata {}: {cleanup}", metadata.id);
                }
                return Err(e);
            }
        };
        if !changed {
            store.delete_file_metadata(&metadata.upload_request_id).await?;
            *self = Self::from_database(store, &self.id).await?;
            return Err(DbError::WrongStatus(self.status));
        }
        info!(
            "upload request {} completed with file {}",
            self.id, metadata.id
        );
        Ok(())
    }

    async fn change<S: UploadStore + ?Sized>(
        &mut self,
        store: &S,
        transition: Transition,
    ) -> DbResult<bool> {
        match store.transition(&self.id, &transition, store.now()).await? {
            Some(stored) => {
                *self = stored;
                Ok(true)
            }
            None => {
                debug!(
                    "upload request {} did not move to {}",
                    self.id,
                    transition.target()
                );
                Ok(false)
            }
        }
    }
}

impl FileMetadata {
    pub async fn save<S: UploadStore + ?Sized>(&self, store: &S) -> DbResult<()> {
        store.insert_file_metadata(self).await
    }

    /// A completed upload of the same content by the same client, if any.
    pub async fn find_duplicate<S: UploadStore + ?Sized>(
        store: &S,
        client_id: &str,
        checksum: &str,
    ) -> DbResult<Option<FileMetadata>> {
        for metadata in store
            .find_file_metadata_by_checksum(checksum, client_id)
            .await?
        {
            let completed = store
                .find_upload_request(&metadata.upload_request_id)
                .await?
                .is_some_and(|r| r.status == Status::Completed);
            if completed {
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }
}

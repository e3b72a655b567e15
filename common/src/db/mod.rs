use async_trait::async_trait;
use bson::DateTime;

use crate::config::Principal;
use crate::schema::{IndexDefinition, IndexSpec};

mod init;
mod memory;
mod mongo;
mod records;

pub use crate::data::*;
pub use init::{apply_schema, initialize_schema, InitError, InitReport, Provision};
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use records::CreateOutcome;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A unique index rejected the write.
    #[error("duplicate key for unique index {index}")]
    DuplicateKey { index: String },
    /// The principal or collection was created by someone else first.
    #[error("object already exists")]
    AlreadyExists,
    #[error("index {name} on {collection} already exists with a different definition")]
    IndexConflict { collection: String, name: String },
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("database row not found")]
    NotFound,
    #[error("wrong status: {0}")]
    WrongStatus(Status),
    #[error(transparent)]
    Driver(#[from] mongodb::error::Error),
    #[error("could not encode document: {0}")]
    Serialize(#[from] bson::ser::Error),
    #[error("could not decode document: {0}")]
    Deserialize(#[from] bson::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// How a query would be answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryPlan {
    IndexScan { index: String },
    CollectionScan,
}

/// Catalog-level operations the initializer needs from a datastore.
///
/// These are primitives; the idempotency rules live in [`apply_schema`].
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn principal_exists(&self, principal: &Principal) -> DbResult<bool>;

    /// Creates the principal with `readWrite` on its database. Returns
    /// `DbError::AlreadyExists` if it appeared since `principal_exists`.
    async fn create_principal(&self, principal: &Principal) -> DbResult<()>;

    async fn collection_names(&self) -> DbResult<Vec<String>>;

    /// Returns `DbError::AlreadyExists` if the collection appeared since
    /// `collection_names`.
    async fn create_collection(&self, name: &str) -> DbResult<()>;

    async fn index_definitions(&self, collection: &str) -> DbResult<Vec<IndexDefinition>>;

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()>;

    /// Plans a query filtering on `filter` and sorting on `sort` without
    /// running it.
    async fn query_plan(
        &self,
        collection: &str,
        filter: &[&str],
        sort: &[&str],
    ) -> DbResult<QueryPlan>;
}

/// Typed access to the upload collections.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Timestamp used for `createdAt`/`updatedAt` on writes.
    fn now(&self) -> DateTime {
        DateTime::now()
    }

    async fn insert_upload_request(&self, request: &UploadRequest) -> DbResult<()>;

    async fn find_upload_request(&self, id: &str) -> DbResult<Option<UploadRequest>>;

    async fn find_by_client_and_upload_id(
        &self,
        client_id: &str,
        upload_id: &str,
    ) -> DbResult<Option<UploadRequest>>;

    /// Requests of one client, oldest first, optionally narrowed to a status.
    async fn find_by_client(
        &self,
        client_id: &str,
        status: Option<Status>,
    ) -> DbResult<Vec<UploadRequest>>;

    /// Requests in `status` last touched before `before`, oldest first.
    async fn find_by_status_updated_before(
        &self,
        status: Status,
        before: DateTime,
    ) -> DbResult<Vec<UploadRequest>>;

    /// Applies `transition` only if the stored request currently admits it.
    /// Returns the request as stored after the change, or `None` if nothing
    /// was changed.
    async fn transition(
        &self,
        id: &str,
        transition: &Transition,
        now: DateTime,
    ) -> DbResult<Option<UploadRequest>>;

    async fn delete_upload_request(&self, id: &str) -> DbResult<bool>;

    async fn insert_file_metadata(&self, metadata: &FileMetadata) -> DbResult<()>;

    async fn find_file_metadata(&self, upload_request_id: &str)
        -> DbResult<Option<FileMetadata>>;

    async fn find_file_metadata_by_checksum(
        &self,
        checksum: &str,
        client_id: &str,
    ) -> DbResult<Vec<FileMetadata>>;

    /// Every `uploadRequestId` referenced from `file_metadata`.
    async fn file_metadata_request_ids(&self) -> DbResult<Vec<String>>;

    async fn delete_file_metadata(&self, upload_request_id: &str) -> DbResult<bool>;
}

use async_trait::async_trait;
use bson::{doc, Bson, DateTime, Document};
use futures::TryStreamExt;
use log::debug;
use mongodb::{
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, Credential, IndexOptions, ReturnDocument, ServerAddress},
    Client, Collection, Database, IndexModel,
};

use super::{
    DbError, DbResult, FileMetadata, QueryPlan, SchemaCatalog, Status, Transition, UploadRequest,
    UploadStore, MAX_ATTEMPTS,
};
use crate::config::{ConnectionConfig, Principal};
use crate::schema::{IndexDefinition, IndexSpec, FILE_METADATA, PRINCIPAL_ROLE, UPLOAD_REQUESTS};

// Server error codes we react to.
const UNAUTHORIZED: i32 = 13;
const NAMESPACE_NOT_FOUND: i32 = 26;
const NAMESPACE_EXISTS: i32 = 48;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
const DUPLICATE_KEY: i32 = 11000;
const USER_ALREADY_EXISTS: i32 = 51003;

const APP_NAME: &str = "fileuploader";

pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connects and pings the target database so bad credentials surface
    /// here rather than on the first real command.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let mut options = match &config.uri {
            Some(uri) => ClientOptions::parse(uri).await?,
            None => {
                let address = ServerAddress::parse(format!("{}:{}", config.host, config.port))?;
                ClientOptions::builder().hosts(vec![address]).build()
            }
        };
        if let Some(admin) = &config.admin {
            options.credential = Some(
                Credential::builder()
                    .username(admin.username.clone())
                    .password(admin.password.clone())
                    .source(config.auth_source.clone())
                    .build(),
            );
        }
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout = Some(config.server_selection_timeout);

        let client = Client::with_options(options)?;
        let db = client.database(&config.database);
        db.run_command(doc! { "ping": 1 }).await.map_err(catalog_error)?;
        debug!("connected to {}", config.target());
        Ok(Self { client, db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn uploads(&self) -> Collection<UploadRequest> {
        self.db.collection(UPLOAD_REQUESTS)
    }

    fn files(&self) -> Collection<FileMetadata> {
        self.db.collection(FILE_METADATA)
    }
}

fn error_code(e: &MongoError) -> Option<i32> {
    match &*e.kind {
        ErrorKind::Command(c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(w)) => Some(w.code),
        _ => None,
    }
}

/// Server failures we react to rather than pass through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServerFailure {
    Unauthorized,
    NamespaceMissing,
    /// The user or collection was created concurrently.
    AlreadyExists,
    /// An index with this name or these keys exists with other options.
    IndexConflict,
    DuplicateKey,
}

impl ServerFailure {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            UNAUTHORIZED => Some(Self::Unauthorized),
            NAMESPACE_NOT_FOUND => Some(Self::NamespaceMissing),
            NAMESPACE_EXISTS | USER_ALREADY_EXISTS => Some(Self::AlreadyExists),
            INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT => Some(Self::IndexConflict),
            DUPLICATE_KEY => Some(Self::DuplicateKey),
            _ => None,
        }
    }

    fn of(e: &MongoError) -> Option<Self> {
        error_code(e).and_then(Self::from_code)
    }
}

/// What a failed index build means for the initializer, `None` when the
/// driver error should be passed on as is.
fn index_failure(failure: Option<ServerFailure>, spec: &IndexSpec) -> Option<DbError> {
    match failure? {
        ServerFailure::IndexConflict => Some(DbError::IndexConflict {
            collection: spec.collection.to_string(),
            name: spec.name.to_string(),
        }),
        ServerFailure::DuplicateKey => Some(DbError::DuplicateKey {
            index: spec.name.to_string(),
        }),
        _ => None,
    }
}

fn error_message(e: &MongoError) -> Option<&str> {
    match &*e.kind {
        ErrorKind::Command(c) => Some(c.message.as_str()),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.message.as_str()),
        _ => None,
    }
}

/// Pulls the index name out of an E11000 message:
/// `E11000 duplicate key error collection: db.coll index: name dup key: { ... }`
fn duplicate_index(message: &str) -> Option<&str> {
    message
        .split_once(" index: ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
}

fn catalog_error(e: MongoError) -> DbError {
    match ServerFailure::of(&e) {
        Some(ServerFailure::Unauthorized) => DbError::Unauthorized(e.to_string()),
        _ => DbError::Driver(e),
    }
}

fn write_error(e: MongoError) -> DbError {
    match ServerFailure::of(&e) {
        Some(ServerFailure::DuplicateKey) => DbError::DuplicateKey {
            index: error_message(&e)
                .and_then(duplicate_index)
                .unwrap_or("_id_")
                .to_string(),
        },
        _ => catalog_error(e),
    }
}

fn definition(collection: &str, model: IndexModel) -> IndexDefinition {
    let options = model.options.unwrap_or_default();
    IndexDefinition {
        collection: collection.to_string(),
        name: options.name.unwrap_or_default(),
        keys: model
            .keys
            .iter()
            .map(|(field, dir)| (field.clone(), direction(dir)))
            .collect(),
        unique: options.unique.unwrap_or(false),
        expire_after: options.expire_after,
    }
}

fn direction(value: &Bson) -> i32 {
    match value {
        Bson::Int32(n) => *n,
        Bson::Int64(n) => *n as i32,
        Bson::Double(n) => *n as i32,
        // text, hashed, 2dsphere...
        _ => 0,
    }
}

fn index_model(spec: &IndexSpec) -> IndexModel {
    let keys: Document = spec
        .keys
        .iter()
        .map(|(field, dir)| (field.to_string(), Bson::Int32(*dir)))
        .collect();
    let options = IndexOptions::builder()
        .name(spec.name.to_string())
        .unique(spec.unique.then_some(true))
        .expire_after(spec.expire_after)
        .build();
    IndexModel::builder().keys(keys).options(options).build()
}

/// Finds the first index scan stage anywhere in an explain plan. Handles
/// both the classic and the slot-based (`queryPlan`) layouts.
fn index_scan(stage: &Document) -> Option<String> {
    if matches!(stage.get_str("stage"), Ok("IXSCAN")) {
        return stage.get_str("indexName").ok().map(str::to_string);
    }
    stage.values().find_map(|value| match value {
        Bson::Document(child) => index_scan(child),
        Bson::Array(children) => children.iter().find_map(|c| match c {
            Bson::Document(child) => index_scan(child),
            _ => None,
        }),
        _ => None,
    })
}

fn transition_filter(id: &str, transition: &Transition) -> Document {
    match transition {
        Transition::Acquire => doc! {
            "_id": id,
            "$or": [
                { "status": Status::Pending.as_str() },
                {
                    "status": Status::Failed.as_str(),
                    "attemptCount": { "$lt": i64::from(MAX_ATTEMPTS) },
                },
            ],
        },
        other => {
            let sources: Vec<&str> = other.sources().iter().map(Status::as_str).collect();
            doc! { "_id": id, "status": { "$in": sources } }
        }
    }
}

fn transition_update(transition: &Transition, now: DateTime) -> Document {
    let mut set = doc! {
        "status": transition.target().as_str(),
        "updatedAt": now,
    };
    let mut update = Document::new();
    match transition {
        Transition::Acquire => {
            set.insert("errorMessage", Bson::Null);
            update.insert("$inc", doc! { "attemptCount": 1 });
        }
        Transition::Complete { file_metadata_id } => {
            set.insert("fileMetadataId", file_metadata_id.as_str());
            set.insert("completedAt", now);
        }
        Transition::Fail { error_message } => {
            set.insert("errorMessage", error_message.as_str());
        }
        Transition::Cancel => {}
    }
    update.insert("$set", set);
    update
}

#[async_trait]
impl SchemaCatalog for MongoStore {
    async fn principal_exists(&self, principal: &Principal) -> DbResult<bool> {
        let reply = self
            .client
            .database(&principal.database)
            .run_command(doc! {
                "usersInfo": { "user": principal.name(), "db": principal.database.as_str() },
            })
            .await
            .map_err(catalog_error)?;
        Ok(reply
            .get_array("users")
            .map(|users| !users.is_empty())
            .unwrap_or(false))
    }

    async fn create_principal(&self, principal: &Principal) -> DbResult<()> {
        let command = doc! {
            "createUser": principal.name(),
            "pwd": principal.credentials.password.as_str(),
            "roles": [{ "role": PRINCIPAL_ROLE, "db": principal.database.as_str() }],
        };
        match self
            .client
            .database(&principal.database)
            .run_command(command)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if ServerFailure::of(&e) == Some(ServerFailure::AlreadyExists) => {
                Err(DbError::AlreadyExists)
            }
            Err(e) => Err(catalog_error(e)),
        }
    }

    async fn collection_names(&self) -> DbResult<Vec<String>> {
        self.db
            .list_collection_names()
            .await
            .map_err(catalog_error)
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        match self.db.create_collection(name).await {
            Ok(()) => Ok(()),
            Err(e) if ServerFailure::of(&e) == Some(ServerFailure::AlreadyExists) => {
                Err(DbError::AlreadyExists)
            }
            Err(e) => Err(catalog_error(e)),
        }
    }

    async fn index_definitions(&self, collection: &str) -> DbResult<Vec<IndexDefinition>> {
        let cursor = match self.db.collection::<Document>(collection).list_indexes().await {
            Ok(cursor) => cursor,
            Err(e) if ServerFailure::of(&e) == Some(ServerFailure::NamespaceMissing) => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(catalog_error(e)),
        };
        let models: Vec<IndexModel> = cursor.try_collect().await?;
        Ok(models
            .into_iter()
            .map(|model| definition(collection, model))
            .collect())
    }

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        let result = self
            .db
            .collection::<Document>(spec.collection)
            .create_index(index_model(spec))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match index_failure(ServerFailure::of(&e), spec) {
                Some(failure) => Err(failure),
                None => Err(catalog_error(e)),
            },
        }
    }

    async fn query_plan(
        &self,
        collection: &str,
        filter: &[&str],
        sort: &[&str],
    ) -> DbResult<QueryPlan> {
        let filter: Document = filter.iter().map(|f| (f.to_string(), Bson::Null)).collect();
        let sort: Document = sort.iter().map(|f| (f.to_string(), Bson::Int32(1))).collect();
        let reply = self
            .db
            .run_command(doc! {
                "explain": { "find": collection, "filter": filter, "sort": sort },
                "verbosity": "queryPlanner",
            })
            .await
            .map_err(catalog_error)?;
        let plan = reply
            .get_document("queryPlanner")
            .and_then(|planner| planner.get_document("winningPlan"))
            .ok()
            .and_then(index_scan)
            .map(|index| QueryPlan::IndexScan { index })
            .unwrap_or(QueryPlan::CollectionScan);
        Ok(plan)
    }
}

#[async_trait]
impl UploadStore for MongoStore {
    async fn insert_upload_request(&self, request: &UploadRequest) -> DbResult<()> {
        self.uploads()
            .insert_one(request)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn find_upload_request(&self, id: &str) -> DbResult<Option<UploadRequest>> {
        Ok(self.uploads().find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_client_and_upload_id(
        &self,
        client_id: &str,
        upload_id: &str,
    ) -> DbResult<Option<UploadRequest>> {
        Ok(self
            .uploads()
            .find_one(doc! { "clientId": client_id, "uploadId": upload_id })
            .await?)
    }

    async fn find_by_client(
        &self,
        client_id: &str,
        status: Option<Status>,
    ) -> DbResult<Vec<UploadRequest>> {
        let mut filter = doc! { "clientId": client_id };
        if let Some(status) = status {
            filter.insert("status", status.as_str());
        }
        let cursor = self
            .uploads()
            .find(filter)
            .sort(doc! { "createdAt": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_by_status_updated_before(
        &self,
        status: Status,
        before: DateTime,
    ) -> DbResult<Vec<UploadRequest>> {
        let cursor = self
            .uploads()
            .find(doc! { "status": status.as_str(), "updatedAt": { "$lt": before } })
            .sort(doc! { "updatedAt": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn transition(
        &self,
        id: &str,
        transition: &Transition,
        now: DateTime,
    ) -> DbResult<Option<UploadRequest>> {
        self.uploads()
            .find_one_and_update(
                transition_filter(id, transition),
                transition_update(transition, now),
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(write_error)
    }

    async fn delete_upload_request(&self, id: &str) -> DbResult<bool> {
        let result = self.uploads().delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn insert_file_metadata(&self, metadata: &FileMetadata) -> DbResult<()> {
        self.files()
            .insert_one(metadata)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn find_file_metadata(
        &self,
        upload_request_id: &str,
    ) -> DbResult<Option<FileMetadata>> {
        Ok(self
            .files()
            .find_one(doc! { "uploadRequestId": upload_request_id })
            .await?)
    }

    async fn find_file_metadata_by_checksum(
        &self,
        checksum: &str,
        client_id: &str,
    ) -> DbResult<Vec<FileMetadata>> {
        let cursor = self
            .files()
            .find(doc! { "checksum": checksum, "clientId": client_id })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn file_metadata_request_ids(&self) -> DbResult<Vec<String>> {
        let ids = self.files().distinct("uploadRequestId", doc! {}).await?;
        Ok(ids
            .into_iter()
            .filter_map(|id| match id {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn delete_file_metadata(&self, upload_request_id: &str) -> DbResult<bool> {
        let result = self
            .files()
            .delete_many(doc! { "uploadRequestId": upload_request_id })
            .await?;
        Ok(result.deleted_count > 0)
    }
}

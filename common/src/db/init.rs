use std::fmt;

use log::{debug, info};

use super::{DbError, DbResult, MongoStore, SchemaCatalog};
use crate::config::{ConnectionConfig, Principal};
use crate::schema::{IndexSpec, COLLECTIONS, INDEXES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provision {
    Created,
    Existing,
}

impl fmt::Display for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provision::Created => write!(f, "created"),
            Provision::Existing => write!(f, "already present"),
        }
    }
}

/// What a schema run did to each object, in the order they were handled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitReport {
    pub steps: Vec<(String, Provision)>,
}

impl InitReport {
    fn record(&mut self, object: String, provision: Provision) {
        debug!("{object}: {provision}");
        self.steps.push((object, provision));
    }

    pub fn get(&self, object: &str) -> Option<Provision> {
        self.steps
            .iter()
            .find(|(name, _)| name == object)
            .map(|(_, p)| *p)
    }

    pub fn created(&self) -> usize {
        self.count(Provision::Created)
    }

    pub fn existing(&self) -> usize {
        self.count(Provision::Existing)
    }

    fn count(&self, provision: Provision) -> usize {
        self.steps.iter().filter(|(_, p)| *p == provision).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("could not connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: DbError,
    },
    #[error("could not provision principal {name}")]
    Principal {
        name: String,
        #[source]
        source: DbError,
    },
    #[error("could not create collection {name}")]
    Collection {
        name: String,
        #[source]
        source: DbError,
    },
    #[error("could not create index {name}")]
    Index {
        name: String,
        #[source]
        source: DbError,
    },
}

/// Connects with `config` and brings its database up to the upload schema.
pub async fn initialize_schema(
    config: &ConnectionConfig,
    principal: &Principal,
) -> Result<InitReport, InitError> {
    let store = MongoStore::connect(config)
        .await
        .map_err(|source| InitError::Connect {
            target: config.target(),
            source,
        })?;
    apply_schema(&store, principal).await
}

/// Ensures the principal, the collections and every index in [`INDEXES`]
/// exist, stopping at the first failure.
///
/// Safe to run repeatedly and concurrently: anything already in place with
/// the wanted definition is left alone.
pub async fn apply_schema<C: SchemaCatalog + ?Sized>(
    catalog: &C,
    principal: &Principal,
) -> Result<InitReport, InitError> {
    let mut report = InitReport::default();

    let provision = ensure_principal(catalog, principal)
        .await
        .map_err(|source| InitError::Principal {
            name: principal.name().to_string(),
            source,
        })?;
    report.record(format!("principal {}", principal.name()), provision);

    for name in COLLECTIONS {
        let provision = ensure_collection(catalog, name)
            .await
            .map_err(|source| InitError::Collection {
                name: name.to_string(),
                source,
            })?;
        report.record(format!("collection {name}"), provision);
    }

    for spec in INDEXES {
        let provision = ensure_index(catalog, spec)
            .await
            .map_err(|source| InitError::Index {
                name: spec.name.to_string(),
                source,
            })?;
        report.record(format!("index {}.{}", spec.collection, spec.name), provision);
    }

    info!(
        "schema for database {} ready: {} created, {} already present",
        principal.database,
        report.created(),
        report.existing()
    );
    Ok(report)
}

async fn ensure_principal<C: SchemaCatalog + ?Sized>(
    catalog: &C,
    principal: &Principal,
) -> DbResult<Provision> {
    if catalog.principal_exists(principal).await? {
        return Ok(Provision::Existing);
    }
    match catalog.create_principal(principal).await {
        Ok(()) => Ok(Provision::Created),
        Err(DbError::AlreadyExists) => Ok(Provision::Existing),
        Err(e) => Err(e),
    }
}

async fn ensure_collection<C: SchemaCatalog + ?Sized>(
    catalog: &C,
    name: &str,
) -> DbResult<Provision> {
    if catalog.collection_names().await?.iter().any(|c| c == name) {
        return Ok(Provision::Existing);
    }
    match catalog.create_collection(name).await {
        Ok(()) => Ok(Provision::Created),
        Err(DbError::AlreadyExists) => Ok(Provision::Existing),
        Err(e) => Err(e),
    }
}

async fn ensure_index<C: SchemaCatalog + ?Sized>(
    catalog: &C,
    spec: &IndexSpec,
) -> DbResult<Provision> {
    let wanted = spec.definition();
    let existing = catalog.index_definitions(spec.collection).await?;
    if let Some(found) = existing.iter().find(|d| d.name == spec.name) {
        if found.same_shape(&wanted) {
            return Ok(Provision::Existing);
        }
        return Err(DbError::IndexConflict {
            collection: spec.collection.to_string(),
            name: spec.name.to_string(),
        });
    }
    catalog.create_index(spec).await?;
    Ok(Provision::Created)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bson::DateTime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{FileMetadata, MemoryStore, NewUpload, QueryPlan, UploadRequest, UploadStore};
    use crate::schema::*;

    fn principal() -> Principal {
        Principal::with_default_name(DEFAULT_DATABASE, "password")
    }

    fn upload(client: &str, upload: &str) -> NewUpload {
        NewUpload {
            client_id: client.to_string(),
            upload_id: upload.to_string(),
            original_filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            file_size: 42,
            checksum: "c0ffee".to_string(),
        }
    }

    async fn initialized() -> MemoryStore {
        let store = MemoryStore::new();
        apply_schema(&store, &principal()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn first_run_creates_everything() {
        let store = MemoryStore::new();
        let report = apply_schema(&store, &principal()).await.unwrap();
        assert_eq!(report.existing(), 0);
        assert_eq!(report.created(), 1 + COLLECTIONS.len() + INDEXES.len());
        assert_eq!(
            report.get("index upload_requests.ttl_idx"),
            Some(Provision::Created)
        );
        assert_eq!(store.collection_names().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let store = initialized().await;
        let report = apply_schema(&store, &principal()).await.unwrap();
        assert_eq!(report.created(), 0);
        assert_eq!(report.existing(), 1 + COLLECTIONS.len() + INDEXES.len());
        assert_eq!(store.collection_names().await.unwrap().len(), 2);
        assert_eq!(store.index_definitions(UPLOAD_REQUESTS).await.unwrap().len(), 3);
        assert_eq!(store.index_definitions(FILE_METADATA).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_runs_agree() {
        let store = Arc::new(MemoryStore::new());
        let p = principal();
        let (a, b) = tokio::join!(
            apply_schema(store.as_ref(), &p),
            apply_schema(store.as_ref(), &p)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(store.index_definitions(UPLOAD_REQUESTS).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn existing_principal_does_not_stop_the_run() {
        let store = MemoryStore::new();
        store.create_principal(&principal()).await.unwrap();
        let report = apply_schema(&store, &principal()).await.unwrap();
        assert_eq!(
            report.get("principal fileUploader"),
            Some(Provision::Existing)
        );
        assert_eq!(report.created(), COLLECTIONS.len() + INDEXES.len());
    }

    #[tokio::test]
    async fn rejected_principal_aborts() {
        let store = MemoryStore::new().read_only();
        let err = apply_schema(&store, &principal()).await.unwrap_err();
        assert!(matches!(
            err,
            InitError::Principal {
                source: DbError::Unauthorized(_),
                ..
            }
        ));
        assert!(store.collection_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_index_aborts_before_later_indexes() {
        const NARROW_STATUS: IndexSpec = IndexSpec {
            collection: UPLOAD_REQUESTS,
            name: STATUS_UPDATED_IDX,
            keys: &[("status", 1)],
            unique: false,
            expire_after: None,
        };
        let store = MemoryStore::new();
        store.create_index(&NARROW_STATUS).await.unwrap();

        let err = apply_schema(&store, &principal()).await.unwrap_err();
        match err {
            InitError::Index { name, source } => {
                assert_eq!(name, STATUS_UPDATED_IDX);
                assert!(matches!(source, DbError::IndexConflict { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let names: Vec<String> = store
            .index_definitions(UPLOAD_REQUESTS)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&CLIENT_UPLOAD_UNIQUE.to_string()));
        assert!(!names.contains(&TTL_IDX.to_string()));
        assert!(store.index_definitions(FILE_METADATA).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_upload_pair_is_unique() {
        let store = initialized().await;
        let now = store.now();
        store
            .insert_upload_request(&UploadRequest::new(upload("a", "1"), now))
            .await
            .unwrap();
        let err = store
            .insert_upload_request(&UploadRequest::new(upload("a", "1"), now))
            .await
            .unwrap_err();
        assert!(
            matches!(err, DbError::DuplicateKey { ref index } if index == CLIENT_UPLOAD_UNIQUE)
        );
        for (client, id) in [("a", "2"), ("b", "1")] {
            store
                .insert_upload_request(&UploadRequest::new(upload(client, id), now))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn one_file_metadata_per_request() {
        let store = initialized().await;
        let now = store.now();
        let request = UploadRequest::new(upload("a", "1"), now);
        let first = FileMetadata::new(&request, "a".to_string(), 42, "c0ffee".to_string(), now);
        let second = FileMetadata::new(&request, "b".to_string(), 42, "c0ffee".to_string(), now);
        store.insert_file_metadata(&first).await.unwrap();
        let err = store.insert_file_metadata(&second).await.unwrap_err();
        assert!(
            matches!(err, DbError::DuplicateKey { ref index } if index == UPLOAD_REQUEST_IDX)
        );
    }

    #[tokio::test]
    async fn status_queries_use_the_status_index() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .query_plan(UPLOAD_REQUESTS, &["status"], &["updatedAt"])
                .await
                .unwrap(),
            QueryPlan::CollectionScan
        );
        apply_schema(&store, &principal()).await.unwrap();
        assert_eq!(
            store
                .query_plan(UPLOAD_REQUESTS, &["status", "updatedAt"], &["updatedAt"])
                .await
                .unwrap(),
            QueryPlan::IndexScan {
                index: STATUS_UPDATED_IDX.to_string()
            }
        );
    }

    #[tokio::test]
    async fn checksum_lookups_use_the_checksum_index() {
        let store = initialized().await;
        assert_eq!(
            store
                .query_plan(FILE_METADATA, &["checksum", "clientId"], &[])
                .await
                .unwrap(),
            QueryPlan::IndexScan {
                index: CHECKSUM_CLIENT_IDX.to_string()
            }
        );
    }

    #[tokio::test]
    async fn requests_expire_a_week_after_creation() {
        let clock = Arc::new(ManualClock::new(DateTime::from_millis(1_700_000_000_000)));
        let store = MemoryStore::with_clock(clock.clone());
        apply_schema(&store, &principal()).await.unwrap();

        let old = UploadRequest::new(upload("a", "old"), store.now());
        store.insert_upload_request(&old).await.unwrap();
        clock.advance(Duration::from_secs(3 * 24 * 3600));
        let young = UploadRequest::new(upload("a", "young"), store.now());
        store.insert_upload_request(&young).await.unwrap();

        // old is exactly a week old now
        clock.advance(Duration::from_secs(4 * 24 * 3600));
        assert_eq!(store.run_ttl_monitor(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(store.run_ttl_monitor(), 1);
        assert!(store.find_upload_request(&old.id).await.unwrap().is_none());
        assert!(store.find_upload_request(&young.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nothing_expires_without_the_ttl_index() {
        let clock = Arc::new(ManualClock::new(DateTime::from_millis(0)));
        let store = MemoryStore::with_clock(clock.clone());
        let r = UploadRequest::new(upload("a", "1"), store.now());
        store.insert_upload_request(&r).await.unwrap();
        clock.advance(UPLOAD_TTL * 2);
        assert_eq!(store.run_ttl_monitor(), 0);
    }
}

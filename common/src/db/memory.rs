use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bson::{Bson, DateTime, Document};
use serde::{de::DeserializeOwned, Serialize};

use super::{
    DbError, DbResult, FileMetadata, QueryPlan, SchemaCatalog, Status, Transition, UploadRequest,
    UploadStore,
};
use crate::clock::{self, Clock, SystemClock};
use crate::config::Principal;
use crate::schema::{IndexDefinition, IndexSpec, FILE_METADATA, PRINCIPAL_ROLE, UPLOAD_REQUESTS};

/// An in-process datastore that behaves like MongoDB where the upload
/// service cares: unique indexes reject duplicates, collections appear on
/// first write, and TTL indexes delete documents when the monitor runs.
///
/// Time comes from the injected [`Clock`], so expiry can be tested without
/// waiting a week.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    read_only: bool,
}

#[derive(Default)]
struct State {
    /// (database, user) -> roles
    principals: BTreeMap<(String, String), Vec<String>>,
    collections: BTreeMap<String, Collection>,
}

#[derive(Default)]
struct Collection {
    indexes: Vec<IndexDefinition>,
    docs: Vec<Document>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            read_only: false,
        }
    }

    /// Refuse every catalog change, like a login without admin rights.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Roles held by `user` on `database`, if the user exists.
    pub fn granted_roles(&self, database: &str, user: &str) -> Option<Vec<String>> {
        self.state()
            .principals
            .get(&(database.to_string(), user.to_string()))
            .cloned()
    }

    /// One pass of the TTL monitor. Returns how many documents were deleted.
    pub fn run_ttl_monitor(&self) -> usize {
        let now = self.clock.now();
        self.state()
            .collections
            .values_mut()
            .map(|c| c.expire(now))
            .sum()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self, what: &str) -> DbResult<()> {
        if self.read_only {
            return Err(DbError::Unauthorized(format!("not allowed to {what}")));
        }
        Ok(())
    }

    fn insert<T: Serialize>(&self, collection: &str, value: &T) -> DbResult<()> {
        let doc = bson::to_document(value)?;
        let mut state = self.state();
        let coll = state.collections.entry(collection.to_string()).or_default();
        coll.check_unique(&doc, None)?;
        coll.docs.push(doc);
        Ok(())
    }

    fn all<T: DeserializeOwned>(&self, collection: &str) -> DbResult<Vec<T>> {
        let state = self.state();
        let Some(coll) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        coll.docs
            .iter()
            .map(|d| bson::from_document(d.clone()).map_err(DbError::from))
            .collect()
    }

    fn delete_where(&self, collection: &str, field: &str, value: &str) -> bool {
        let mut state = self.state();
        let Some(coll) = state.collections.get_mut(collection) else {
            return false;
        };
        let before = coll.docs.len();
        coll.docs
            .retain(|d| d.get(field) != Some(&Bson::String(value.to_string())));
        coll.docs.len() != before
    }
}

impl Collection {
    fn check_unique(&self, doc: &Document, skip: Option<usize>) -> DbResult<()> {
        let others = || {
            self.docs
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, d)| d)
        };
        let id = doc.get("_id");
        if others().any(|d| d.get("_id") == id) {
            return Err(DbError::DuplicateKey {
                index: "_id_".to_string(),
            });
        }
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, doc);
            if others().any(|d| index_key(index, d) == key) {
                return Err(DbError::DuplicateKey {
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn has_duplicates(&self, index: &IndexDefinition) -> bool {
        let keys: Vec<Vec<Bson>> = self.docs.iter().map(|d| index_key(index, d)).collect();
        keys.iter()
            .enumerate()
            .any(|(i, k)| keys[i + 1..].contains(k))
    }

    fn expire(&mut self, now: DateTime) -> usize {
        let before = self.docs.len();
        for index in &self.indexes {
            let (Some(ttl), [(field, _)]) = (index.expire_after, index.keys.as_slice()) else {
                continue;
            };
            self.docs.retain(|d| match d.get(field) {
                Some(Bson::DateTime(at)) => clock::after(*at, ttl) >= now,
                _ => true,
            });
        }
        before - self.docs.len()
    }
}

fn index_key(index: &IndexDefinition, doc: &Document) -> Vec<Bson> {
    index
        .key_fields()
        .map(|f| doc.get(f).cloned().unwrap_or(Bson::Null))
        .collect()
}

#[async_trait]
impl SchemaCatalog for MemoryStore {
    async fn principal_exists(&self, principal: &Principal) -> DbResult<bool> {
        Ok(self
            .granted_roles(&principal.database, principal.name())
            .is_some())
    }

    async fn create_principal(&self, principal: &Principal) -> DbResult<()> {
        self.check_writable("create users")?;
        let key = (principal.database.clone(), principal.name().to_string());
        let mut state = self.state();
        if state.principals.contains_key(&key) {
            return Err(DbError::AlreadyExists);
        }
        state
            .principals
            .insert(key, vec![PRINCIPAL_ROLE.to_string()]);
        Ok(())
    }

    async fn collection_names(&self) -> DbResult<Vec<String>> {
        Ok(self.state().collections.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        self.check_writable("create collections")?;
        let mut state = self.state();
        if state.collections.contains_key(name) {
            return Err(DbError::AlreadyExists);
        }
        state
            .collections
            .insert(name.to_string(), Collection::default());
        Ok(())
    }

    async fn index_definitions(&self, collection: &str) -> DbResult<Vec<IndexDefinition>> {
        Ok(self
            .state()
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        self.check_writable("create indexes")?;
        let wanted = spec.definition();
        let mut state = self.state();
        let coll = state
            .collections
            .entry(spec.collection.to_string())
            .or_default();
        let conflict = || DbError::IndexConflict {
            collection: spec.collection.to_string(),
            name: spec.name.to_string(),
        };
        if let Some(found) = coll.indexes.iter().find(|d| d.name == wanted.name) {
            return if found.same_shape(&wanted) {
                Ok(())
            } else {
                Err(conflict())
            };
        }
        if coll.indexes.iter().any(|d| d.keys == wanted.keys) {
            return Err(conflict());
        }
        if wanted.unique && coll.has_duplicates(&wanted) {
            return Err(DbError::DuplicateKey {
                index: wanted.name,
            });
        }
        coll.indexes.push(wanted);
        Ok(())
    }

    async fn query_plan(
        &self,
        collection: &str,
        filter: &[&str],
        sort: &[&str],
    ) -> DbResult<QueryPlan> {
        let state = self.state();
        let plan = state
            .collections
            .get(collection)
            .and_then(|c| c.indexes.iter().find(|i| i.supports(filter, sort)))
            .map(|i| QueryPlan::IndexScan {
                index: i.name.clone(),
            })
            .unwrap_or(QueryPlan::CollectionScan);
        Ok(plan)
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    fn now(&self) -> DateTime {
        self.clock.now()
    }

    async fn insert_upload_request(&self, request: &UploadRequest) -> DbResult<()> {
        self.insert(UPLOAD_REQUESTS, request)
    }

    async fn find_upload_request(&self, id: &str) -> DbResult<Option<UploadRequest>> {
        let all: Vec<UploadRequest> = self.all(UPLOAD_REQUESTS)?;
        Ok(all.into_iter().find(|r| r.id == id))
    }

    async fn find_by_client_and_upload_id(
        &self,
        client_id: &str,
        upload_id: &str,
    ) -> DbResult<Option<UploadRequest>> {
        let all: Vec<UploadRequest> = self.all(UPLOAD_REQUESTS)?;
        Ok(all
            .into_iter()
            .find(|r| r.client_id == client_id && r.upload_id == upload_id))
    }

    async fn find_by_client(
        &self,
        client_id: &str,
        status: Option<Status>,
    ) -> DbResult<Vec<UploadRequest>> {
        let mut found: Vec<UploadRequest> = self
            .all::<UploadRequest>(UPLOAD_REQUESTS)?
            .into_iter()
            .filter(|r| r.client_id == client_id && status.map_or(true, |s| r.status == s))
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn find_by_status_updated_before(
        &self,
        status: Status,
        before: DateTime,
    ) -> DbResult<Vec<UploadRequest>> {
        let mut found: Vec<UploadRequest> = self
            .all::<UploadRequest>(UPLOAD_REQUESTS)?
            .into_iter()
            .filter(|r| r.status == status && r.updated_at < before)
            .collect();
        found.sort_by_key(|r| r.updated_at);
        Ok(found)
    }

    async fn transition(
        &self,
        id: &str,
        transition: &Transition,
        now: DateTime,
    ) -> DbResult<Option<UploadRequest>> {
        let mut state = self.state();
        let Some(coll) = state.collections.get_mut(UPLOAD_REQUESTS) else {
            return Ok(None);
        };
        let wanted = Bson::String(id.to_string());
        let Some(pos) = coll.docs.iter().position(|d| d.get("_id") == Some(&wanted)) else {
            return Ok(None);
        };
        let mut request: UploadRequest = bson::from_document(coll.docs[pos].clone())?;
        if request.apply(transition, now).is_err() {
            return Ok(None);
        }
        let doc = bson::to_document(&request)?;
        coll.check_unique(&doc, Some(pos))?;
        coll.docs[pos] = doc;
        Ok(Some(request))
    }

    async fn delete_upload_request(&self, id: &str) -> DbResult<bool> {
        Ok(self.delete_where(UPLOAD_REQUESTS, "_id", id))
    }

    async fn insert_file_metadata(&self, metadata: &FileMetadata) -> DbResult<()> {
        self.insert(FILE_METADATA, metadata)
    }

    async fn find_file_metadata(
        &self,
        upload_request_id: &str,
    ) -> DbResult<Option<FileMetadata>> {
        let all: Vec<FileMetadata> = self.all(FILE_METADATA)?;
        Ok(all
            .into_iter()
            .find(|m| m.upload_request_id == upload_request_id))
    }

    async fn find_file_metadata_by_checksum(
        &self,
        checksum: &str,
        client_id: &str,
    ) -> DbResult<Vec<FileMetadata>> {
        let all: Vec<FileMetadata> = self.all(FILE_METADATA)?;
        Ok(all
            .into_iter()
            .filter(|m| m.checksum == checksum && m.client_id == client_id)
            .collect())
    }

    async fn file_metadata_request_ids(&self) -> DbResult<Vec<String>> {
        let all: Vec<FileMetadata> = self.all(FILE_METADATA)?;
        let mut ids: Vec<String> = all.into_iter().map(|m| m.upload_request_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn delete_file_metadata(&self, upload_request_id: &str) -> DbResult<bool> {
        Ok(self.delete_where(FILE_METADATA, "uploadRequestId", upload_request_id))
    }
}

//! The collections and indexes the upload service relies on.
//!
//! Everything here is plain data; `db::init` walks it and asks a backend to
//! make it so.

use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "fileUploader";
pub const DEFAULT_PRINCIPAL: &str = "fileUploader";
/// Role granted to the application principal on its own database.
pub const PRINCIPAL_ROLE: &str = "readWrite";

pub const UPLOAD_REQUESTS: &str = "upload_requests";
pub const FILE_METADATA: &str = "file_metadata";

pub const COLLECTIONS: &[&str] = &[UPLOAD_REQUESTS, FILE_METADATA];

/// Upload requests are purged this long after `createdAt`.
pub const UPLOAD_TTL: Duration = Duration::from_secs(604_800);

pub const CLIENT_UPLOAD_UNIQUE: &str = "client_upload_unique";
pub const STATUS_UPDATED_IDX: &str = "status_updated_idx";
pub const TTL_IDX: &str = "ttl_idx";
pub const UPLOAD_REQUEST_IDX: &str = "upload_request_idx";
pub const CHECKSUM_CLIENT_IDX: &str = "checksum_client_idx";

/// A named index as the service wants it to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub name: &'static str,
    /// Field name and direction (1 ascending, -1 descending), in key order.
    pub keys: &'static [(&'static str, i32)],
    pub unique: bool,
    pub expire_after: Option<Duration>,
}

/// Applied in order.
pub const INDEXES: &[IndexSpec] = &[
    IndexSpec {
        collection: UPLOAD_REQUESTS,
        name: CLIENT_UPLOAD_UNIQUE,
        keys: &[("clientId", 1), ("uploadId", 1)],
        unique: true,
        expire_after: None,
    },
    IndexSpec {
        collection: UPLOAD_REQUESTS,
        name: STATUS_UPDATED_IDX,
        keys: &[("status", 1), ("updatedAt", 1)],
        unique: false,
        expire_after: None,
    },
    IndexSpec {
        collection: UPLOAD_REQUESTS,
        name: TTL_IDX,
        keys: &[("createdAt", 1)],
        unique: false,
        expire_after: Some(UPLOAD_TTL),
    },
    IndexSpec {
        collection: FILE_METADATA,
        name: UPLOAD_REQUEST_IDX,
        keys: &[("uploadRequestId", 1)],
        unique: true,
        expire_after: None,
    },
    IndexSpec {
        collection: FILE_METADATA,
        name: CHECKSUM_CLIENT_IDX,
        keys: &[("checksum", 1), ("clientId", 1)],
        unique: false,
        expire_after: None,
    },
];

impl IndexSpec {
    pub fn definition(&self) -> IndexDefinition {
        IndexDefinition {
            collection: self.collection.to_string(),
            name: self.name.to_string(),
            keys: self
                .keys
                .iter()
                .map(|(field, dir)| (field.to_string(), *dir))
                .collect(),
            unique: self.unique,
            expire_after: self.expire_after,
        }
    }
}

/// An index as a backend reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDefinition {
    pub collection: String,
    pub name: String,
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
    pub expire_after: Option<Duration>,
}

impl IndexDefinition {
    pub fn key_fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(field, _)| field.as_str())
    }

    /// Same keys in the same order with the same options. The name is not
    /// compared.
    pub fn same_shape(&self, other: &IndexDefinition) -> bool {
        self.keys == other.keys
            && self.unique == other.unique
            && self.expire_after == other.expire_after
    }

    /// Whether a query with equality/range predicates on `filter` and a sort
    /// on `sort` can walk this index instead of scanning the collection.
    ///
    /// The filtered fields must make up a prefix of the key (in any order)
    /// and the sort fields must continue that prefix in order.
    pub fn supports(&self, filter: &[&str], sort: &[&str]) -> bool {
        if filter.is_empty() && sort.is_empty() {
            return false;
        }
        let fields: Vec<&str> = self.key_fields().collect();
        if filter.len() + sort.len() > fields.len() {
            // a sort on an already-filtered field still fits
            let extra = sort.iter().filter(|s| !filter.contains(s)).count();
            if filter.len() + extra > fields.len() {
                return false;
            }
        }
        let prefix = &fields[..filter.len()];
        if !filter.iter().all(|f| prefix.contains(f)) {
            return false;
        }
        let rest = sort.iter().filter(|s| !filter.contains(s));
        rest.zip(&fields[filter.len()..]).all(|(s, f)| s == f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(name: &str) -> IndexDefinition {
        INDEXES
            .iter()
            .find(|spec| spec.name == name)
            .map(IndexSpec::definition)
            .unwrap()
    }

    #[test]
    fn index_names_are_unique() {
        let mut names: Vec<&str> = INDEXES.iter().map(|i| i.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), INDEXES.len());
    }

    #[test]
    fn every_index_targets_a_known_collection() {
        assert!(INDEXES.iter().all(|i| COLLECTIONS.contains(&i.collection)));
    }

    #[test]
    fn ttl_is_seven_days() {
        assert_eq!(index(TTL_IDX).expire_after, Some(Duration::from_secs(604800)));
    }

    #[test]
    fn shape_comparison_ignores_name_but_not_options() {
        let a = index(CLIENT_UPLOAD_UNIQUE);
        let mut b = a.clone();
        b.name = "other".to_string();
        assert!(a.same_shape(&b));
        b.unique = false;
        assert!(!a.same_shape(&b));
    }

    #[test]
    fn status_index_serves_status_and_update_time() {
        let idx = index(STATUS_UPDATED_IDX);
        assert!(idx.supports(&["status"], &["updatedAt"]));
        assert!(idx.supports(&["status", "updatedAt"], &[]));
        assert!(idx.supports(&["updatedAt", "status"], &["updatedAt"]));
        assert!(idx.supports(&["status"], &[]));
        assert!(!idx.supports(&["updatedAt"], &[]));
        assert!(!idx.supports(&[], &[]));
    }

    #[test]
    fn checksum_index_needs_checksum_first() {
        let idx = index(CHECKSUM_CLIENT_IDX);
        assert!(idx.supports(&["checksum", "clientId"], &[]));
        assert!(idx.supports(&["clientId", "checksum"], &[]));
        assert!(!idx.supports(&["clientId"], &[]));
        assert!(!idx.supports(&["clientId"], &["checksum"]));
    }
}

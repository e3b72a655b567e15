use std::{collections::BTreeMap, fmt, fs, io, path::Path};

use bson::DateTime;
use serde::{Deserialize, Serialize};

use crate::hash_file;

/// How many times an upload may enter PROCESSING before a failure is final.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// The request has been recorded but nobody is working on it yet.
    Pending,
    /// A worker has acquired the request and is receiving or storing the file.
    Processing,
    /// The file is stored and its metadata recorded. Terminal.
    Completed,
    /// Processing failed. Can be retried until `MAX_ATTEMPTS` is reached.
    Failed,
    /// The client gave up on the upload. Terminal.
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Processing,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    #[serde(rename = "_id")]
    pub id: String,
    pub client_id: String,
    /// Chosen by the client; unique per client.
    pub upload_id: String,
    pub status: Status,
    #[serde(default)]
    pub file_metadata_id: Option<String>,

    pub original_filename: String,
    pub content_type: String,
    pub file_size: u64,
    /// The checksum the client claims the file has.
    pub checksum: String,

    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Indexed with a TTL; the datastore deletes the request a week after this.
    pub created_at: DateTime,
    pub updated_at: DateTime,
    #[serde(default)]
    pub completed_at: Option<DateTime>,
}

/// What a client declares when starting an upload.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub client_id: String,
    pub upload_id: String,
    pub original_filename: String,
    pub content_type: String,
    pub file_size: u64,
    pub checksum: String,
}

/// A status change together with the fields it touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Acquire,
    Complete { file_metadata_id: String },
    Fail { error_message: String },
    Cancel,
}

impl Transition {
    pub fn target(&self) -> Status {
        match self {
            Transition::Acquire => Status::Processing,
            Transition::Complete { .. } => Status::Completed,
            Transition::Fail { .. } => Status::Failed,
            Transition::Cancel => Status::Cancelled,
        }
    }

    /// States a request may be in for this transition to apply. `Acquire`
    /// from FAILED is further limited by the attempt count.
    pub fn sources(&self) -> &'static [Status] {
        match self {
            Transition::Acquire => &[Status::Pending, Status::Failed],
            Transition::Complete { .. } | Transition::Fail { .. } => &[Status::Processing],
            Transition::Cancel => &[Status::Pending, Status::Processing, Status::Failed],
        }
    }
}

impl UploadRequest {
    pub fn new(upload: NewUpload, now: DateTime) -> Self {
        Self {
            id: uuidv7::create(),
            client_id: upload.client_id,
            upload_id: upload.upload_id,
            status: Status::Pending,
            file_metadata_id: None,
            original_filename: upload.original_filename,
            content_type: upload.content_type,
            file_size: upload.file_size,
            checksum: upload.checksum,
            attempt_count: 0,
            error_message: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn can_transition_to(&self, to: Status) -> bool {
        match self.status {
            Status::Pending => matches!(
                to,
                Status::Processing | Status::Failed | Status::Cancelled
            ),
            Status::Processing => matches!(
                to,
                Status::Completed | Status::Failed | Status::Cancelled
            ),
            Status::Failed => match to {
                Status::Processing => self.can_retry(),
                Status::Cancelled => true,
                _ => false,
            },
            Status::Completed | Status::Cancelled => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == Status::Failed && self.attempt_count < MAX_ATTEMPTS
    }

    /// Whether `transition` would be accepted right now.
    pub fn admits(&self, transition: &Transition) -> bool {
        transition.sources().contains(&self.status)
            && self.can_transition_to(transition.target())
    }

    /// Applies `transition` in place, refusing it if the current status does
    /// not allow it. Returns the status the request was refused in.
    pub fn apply(&mut self, transition: &Transition, now: DateTime) -> Result<(), Status> {
        if !self.admits(transition) {
            return Err(self.status);
        }
        match transition {
            Transition::Acquire => {
                self.attempt_count += 1;
                self.error_message = None;
            }
            Transition::Complete { file_metadata_id } => {
                self.file_metadata_id = Some(file_metadata_id.clone());
                self.completed_at = Some(now);
            }
            Transition::Fail { error_message } => {
                self.error_message = Some(error_message.clone());
            }
            Transition::Cancel => {}
        }
        self.status = transition.target();
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub provider: String,
    pub bucket: String,
    pub object_key: String,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(rename = "_id")]
    pub id: String,
    /// At most one metadata document per request.
    pub upload_request_id: String,
    pub client_id: String,
    pub upload_id: String,

    pub original_filename: String,
    pub storage_filename: String,
    pub content_type: String,
    pub size: u64,
    /// SHA-256 of the stored bytes, lowercase hex.
    pub checksum: String,

    #[serde(default)]
    pub storage_info: Option<StorageInfo>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub uploaded_at: DateTime,
}

impl FileMetadata {
    pub fn new(
        request: &UploadRequest,
        storage_filename: String,
        size: u64,
        checksum: String,
        now: DateTime,
    ) -> Self {
        Self {
            id: uuidv7::create(),
            upload_request_id: request.id.clone(),
            client_id: request.client_id.clone(),
            upload_id: request.upload_id.clone(),
            original_filename: request.original_filename.clone(),
            storage_filename,
            content_type: request.content_type.clone(),
            size,
            checksum,
            storage_info: None,
            metadata: BTreeMap::new(),
            uploaded_at: now,
        }
    }

    /// Describes a fully received file on disk, hashing it in the process.
    pub fn from_path(request: &UploadRequest, path: &Path, now: DateTime) -> io::Result<Self> {
        let size = fs::metadata(path)?.len();
        let checksum = hash_file(fs::File::open(path)?)?;
        let storage_filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Err(io::Error::other("file name is not valid UTF-8")),
        };
        Ok(Self::new(request, storage_filename, size, checksum, now))
    }

    pub fn with_storage_info(mut self, info: StorageInfo) -> Self {
        self.storage_info = Some(info);
        self
    }
}

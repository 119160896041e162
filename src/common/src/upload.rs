//! Upload records as read from the catalog.

use std::fmt;

/// Prefix under which every upload's object lives inside a bucket.
pub const OBJECT_KEY_PREFIX: &str = "files/";

/// One catalog row describing an upload.
///
/// An empty `path` means the upload never had a backing object, so only its
/// catalog entry can be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: i64,
    pub owner_id: i32,
    pub store_id: u8,
    pub size_bytes: i32,
    pub pool_id: i32,
    pub path: String,
}

impl UploadRecord {
    pub fn has_object(&self) -> bool {
        !self.path.is_empty()
    }

    /// Key of the backing object within its endpoint's bucket.
    pub fn object_key(&self) -> String {
        object_key(&self.path)
    }

    pub fn reference_key(&self) -> ReferenceKey {
        ReferenceKey::new(self.store_id, &self.path)
    }
}

/// Maps a catalog path to its object key.
pub fn object_key(path: &str) -> String {
    format!("{OBJECT_KEY_PREFIX}{path}")
}

/// Identity of a physical object: the store it lives in plus its path.
///
/// Several uploads may share one key when their content was deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceKey {
    pub store_id: u8,
    pub path: String,
}

impl ReferenceKey {
    pub fn new(store_id: u8, path: impl Into<String>) -> Self {
        Self {
            store_id,
            path: path.into(),
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store_id, self.path)
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// A bucket/scope/collection triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// The default collection of `bucket`.
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_SCOPE, DEFAULT_COLLECTION)
    }

    /// The keyspace in query-language form, e.g. `` `b`.`s`.`c` ``.
    pub fn to_query_keyspace(&self) -> String {
        format!("`{}`.`{}`.`{}`", self.bucket, self.scope, self.collection)
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Fully qualified identity of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId {
    pub keyspace: Keyspace,
    pub key: String,
}

impl DocId {
    pub fn new(keyspace: Keyspace, key: impl Into<String>) -> Self {
        Self {
            keyspace,
            key: key.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.keyspace.bucket
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.keyspace, self.key)
    }
}

/// Transaction id plus attempt id, as stamped on staged documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeId {
    #[serde(rename = "txn")]
    pub transaction_id: String,
    #[serde(rename = "atmpt")]
    pub attempt_id: String,
}

/// Location of an Active Transaction Record document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtrRef {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "scp")]
    pub scope: String,
    #[serde(rename = "coll")]
    pub collection: String,
    #[serde(rename = "id")]
    pub atr_key: String,
}

impl AtrRef {
    pub fn new(keyspace: &Keyspace, atr_key: impl Into<String>) -> Self {
        Self {
            bucket: keyspace.bucket.clone(),
            scope: keyspace.scope.clone(),
            collection: keyspace.collection.clone(),
            atr_key: atr_key.into(),
        }
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }

    pub fn doc_id(&self) -> DocId {
        DocId::new(self.keyspace(), &self.atr_key)
    }
}

impl fmt::Display for AtrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}::{}",
            self.bucket, self.scope, self.collection, self.atr_key
        )
    }
}

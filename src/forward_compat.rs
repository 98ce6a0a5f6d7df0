//! Gate against metadata written by peers speaking a newer protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{ErrorBuilder, ErrorClass, TransactionOperationFailed};

/// Highest protocol version this crate implements.
pub const SUPPORTED_PROTOCOL: (u32, u32) = (2, 0);

/// Protocol extensions this crate implements, by wire code.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "TI",     // transaction id in ATR entries
    "TO",     // time-optimized unstaging
    "RC",     // remove completed entries
    "UA",     // tolerate unknown ATR states
    "CM",     // custom metadata collection
    "QU",     // query mode
    "SD",     // store durability in ATR
    "CO",     // all KV combinations
    "IX",     // insert over existing tombstone
    "BF3787", // staged insert over non-tombstone
    "BF3705", // write-write check on staged insert
];

/// Places in the protocol where peers may place compatibility requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionPoint {
    Gets,
    GetsReadingAtr,
    WriteWriteConflictReplacing,
    WriteWriteConflictRemoving,
    WriteWriteConflictInserting,
    WriteWriteConflictInsertingGet,
    WriteWriteConflictReadingAtr,
    CleanupEntry,
}

impl InteractionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionPoint::Gets => "G",
            InteractionPoint::GetsReadingAtr => "G_A",
            InteractionPoint::WriteWriteConflictReplacing => "WW_R",
            InteractionPoint::WriteWriteConflictRemoving => "WW_RP",
            InteractionPoint::WriteWriteConflictInserting => "WW_I",
            InteractionPoint::WriteWriteConflictInsertingGet => "WW_IG",
            InteractionPoint::WriteWriteConflictReadingAtr => "WW_RA",
            InteractionPoint::CleanupEntry => "CL_E",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Minimum protocol version, e.g. `"2.1"`.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Required extension code.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// `"r"` to retry the transaction, anything else fails it.
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
    #[serde(rename = "ra", default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Requirement {
    fn is_supported(&self) -> bool {
        if let Some(ext) = &self.extension {
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                return false;
            }
        }
        match self.protocol.as_deref().map(parse_version) {
            Some(Some(required)) => required <= SUPPORTED_PROTOCOL,
            // an unparseable version is newer than anything we know
            Some(None) => false,
            None => true,
        }
    }
}

fn parse_version(v: &str) -> Option<(u32, u32)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

/// Opaque forward-compatibility marker keyed by interaction point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardCompatibility(pub BTreeMap<String, Vec<Requirement>>);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("forward compatibility failure at {interaction_point} (retry={retry})")]
pub struct ForwardCompatibilityFailure {
    pub interaction_point: &'static str,
    pub retry: bool,
}

impl ForwardCompatibilityFailure {
    pub(crate) fn into_operation_failed(self) -> TransactionOperationFailed {
        let retry = self.retry;
        let builder = ErrorBuilder::new(ErrorClass::FailOther).cause(self);
        if retry {
            builder.retry_transaction().build()
        } else {
            builder.build()
        }
    }
}

/// Checks the requirements recorded at `point`.
///
/// On a retryable failure with a retry-after hint, waits that long before
/// returning so the retried transaction does not spin.
pub async fn check(
    fc: Option<&ForwardCompatibility>,
    point: InteractionPoint,
) -> Result<(), ForwardCompatibilityFailure> {
    let Some(requirements) = fc.and_then(|fc| fc.0.get(point.as_str())) else {
        return Ok(());
    };
    for req in requirements {
        if req.is_supported() {
            continue;
        }
        warn!(
            "forward compatibility requirement {:?} not met at {}",
            req,
            point.as_str()
        );
        let retry = req.behavior.as_deref() == Some("r");
        if retry {
            if let Some(ms) = req.retry_after_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        return Err(ForwardCompatibilityFailure {
            interaction_point: point.as_str(),
            retry,
        });
    }
    Ok(())
}

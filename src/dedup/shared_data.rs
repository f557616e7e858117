use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde::Serialize;

use crate::DependencyId;
use crate::DependencyValue;
use crate::Result;
use crate::SerializationError;

/// Upper bound on a decompressed snapshot
const MAX_DECODED_BYTES: u64 = 64 * 1024 * 1024;

/// One dependency inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedValue {
    pub value: DependencyValue,
    pub index: u64,
}

/// Snapshot of a template's shareable dependency values, written by the
/// leader and adopted by followers.
///
/// Encoded as gzip-compressed JSON. Unknown fields are ignored and missing
/// optional fields default, so older and newer producers can coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedRenderData {
    /// Producer version
    #[serde(default)]
    pub version: String,
    /// Leadership term of the producer
    pub term: u64,
    /// Milliseconds since the unix epoch
    #[serde(default)]
    pub generated_at: u64,
    #[serde(default)]
    pub values: BTreeMap<DependencyId, SharedValue>,
}

impl SharedRenderData {
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).map_err(SerializationError::Json)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(SerializationError::Compression)?;
        let compressed = encoder.finish().map_err(SerializationError::Compression)?;
        Ok(Bytes::from(compressed))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut json = Vec::new();
        GzDecoder::new(raw)
            .take(MAX_DECODED_BYTES)
            .read_to_end(&mut json)
            .map_err(SerializationError::Compression)?;
        let data = serde_json::from_slice(&json).map_err(SerializationError::Json)?;
        Ok(data)
    }
}

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::constants::DEDUP_DATA_SUFFIX;
use crate::constants::DEDUP_LOCK_SUFFIX;
use crate::constants::DEDUP_TERM_SUFFIX;
use crate::time::get_now_as_millis;
use crate::CoordinationClient;
use crate::DedupError;
use crate::Error;
use crate::LeaseId;
use crate::Result;
use crate::SerializationError;
use crate::TemplateId;

/// Times the term bump is retried when another candidate raced it
const TERM_BUMP_ATTEMPTS: usize = 3;

/// Backend keys of one deduplicated template.
///
/// Derived only from the template id, so every instance rendering the same
/// template meets at the same keys whatever its dependency set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKeys {
    pub lock: String,
    pub data: String,
    pub term: String,
}

impl DedupKeys {
    pub fn for_template(
        prefix: &str,
        template: &TemplateId,
    ) -> Self {
        let digest = hex::encode(Sha256::digest(template.as_str().as_bytes()));
        let base = format!("{}/{}", prefix.trim_end_matches('/'), digest);
        Self {
            lock: format!("{base}/{DEDUP_LOCK_SUFFIX}"),
            data: format!("{base}/{DEDUP_DATA_SUFFIX}"),
            term: format!("{base}/{DEDUP_TERM_SUFFIX}"),
        }
    }
}

/// Value of the lock key while a leader holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    /// Instance id of the leader
    pub leader: String,
    pub term: u64,
    pub lease_id: LeaseId,
    /// Milliseconds since the unix epoch, as estimated at acquisition
    pub lease_expiry_ms: u64,
}

impl ElectionRecord {
    pub fn encode(&self) -> Result<Bytes> {
        let raw = serde_json::to_vec(self).map_err(SerializationError::Json)?;
        Ok(Bytes::from(raw))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw).map_err(SerializationError::Json)?)
    }
}

/// Reads the current election record, if a leader holds the lock.
pub(crate) async fn current_leader(
    client: &dyn CoordinationClient,
    keys: &DedupKeys,
) -> Result<Option<ElectionRecord>> {
    match client.read_key(&keys.lock, 0, Duration::ZERO).await? {
        Some(record) => Ok(Some(ElectionRecord::decode(&record.value)?)),
        None => Ok(None),
    }
}

/// Tries to take the lock for `lease`.
///
/// Returns the new term on success and `None` while another live lease
/// holds the lock. The term counter is bumped with compare-and-swap after
/// the lock is taken, so terms keep increasing across lease expiries.
pub(crate) async fn try_acquire(
    client: &dyn CoordinationClient,
    keys: &DedupKeys,
    instance_id: &str,
    lease: LeaseId,
    lease_ttl: Duration,
) -> Result<Option<u64>> {
    for _ in 0..TERM_BUMP_ATTEMPTS {
        let (previous, revision) = read_term(client, keys).await?;
        let term = previous + 1;

        let record = ElectionRecord {
            leader: instance_id.to_string(),
            term,
            lease_id: lease,
            lease_expiry_ms: get_now_as_millis() + lease_ttl.as_millis() as u64,
        };
        if !client.acquire_lock(&keys.lock, lease, record.encode()?).await? {
            return Ok(None);
        }

        let bumped = client
            .write_key(&keys.term, Bytes::from(term.to_string()), Some(revision))
            .await?;
        if bumped.ok {
            return Ok(Some(term));
        }
        debug!(key = %keys.term, term, "term bumped concurrently, re-reading");
    }

    Err(Error::Dedup(DedupError::StaleWriteRejected {
        key: keys.term.clone(),
        expected: None,
    }))
}

/// Last persisted term and the revision of the term key (0 when absent).
async fn read_term(
    client: &dyn CoordinationClient,
    keys: &DedupKeys,
) -> Result<(u64, u64)> {
    let Some(record) = client.read_key(&keys.term, 0, Duration::ZERO).await? else {
        return Ok((0, 0));
    };
    let term = std::str::from_utf8(&record.value)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            Error::Dedup(DedupError::MalformedSharedData {
                key: keys.term.clone(),
                reason: "term is not an integer".into(),
            })
        })?;
    Ok((term, record.revision))
}

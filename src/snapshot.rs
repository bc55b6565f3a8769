//! Request-scoped data snapshots
//!
//! A connector read is captured once per request as an immutable
//! `DataSnapshot`. Later reads of the same capability with the same
//! parameters inside that request see the same records, even when two
//! tasks ask concurrently.

use crate::models::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// Identifies the consistent point-in-time view a request reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotToken {
    pub request_id: Uuid,
    pub as_of: DateTime<Utc>,
}

impl SnapshotToken {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            as_of: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub snapshot_id: Uuid,
    pub source: String,
    pub parameters: Value,
    pub taken_at: DateTime<Utc>,
    pub records: Arc<Vec<Record>>,
    pub digest: String,
}

impl DataSnapshot {
    pub fn new(source: impl Into<String>, parameters: Value, records: Vec<Record>) -> Self {
        let source = source.into();
        let digest = digest_json(&(&source, &parameters, &records));
        Self {
            snapshot_id: Uuid::new_v4(),
            source,
            parameters,
            taken_at: Utc::now(),
            records: Arc::new(records),
            digest,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

type SnapshotKey = (String, String);

/// Memo of every snapshot taken while serving one request
#[derive(Default)]
pub struct SnapshotSet {
    cells: Mutex<HashMap<SnapshotKey, Arc<OnceCell<DataSnapshot>>>>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoised snapshot for `(source, parameters)`, or run `fetch`
    /// to take it. The flag is true when an earlier read was reused.
    ///
    /// A failed fetch leaves the slot empty so a retry can fill it.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        source: &str,
        parameters: &Value,
        fetch: F,
    ) -> std::result::Result<(DataSnapshot, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<DataSnapshot, E>>,
    {
        let key = (source.to_string(), canonical_parameters(parameters));
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key).or_default().clone()
        };

        let mut fetched = false;
        let snapshot = cell
            .get_or_try_init(|| {
                fetched = true;
                fetch()
            })
            .await?;

        Ok((snapshot.clone(), !fetched))
    }

    pub async fn snapshots(&self) -> Vec<DataSnapshot> {
        let cells = self.cells.lock().await;
        cells.values().filter_map(|c| c.get().cloned()).collect()
    }

    /// SHA-256 over the sorted member digests
    pub async fn digest(&self) -> String {
        let mut digests: Vec<String> = self
            .snapshots()
            .await
            .into_iter()
            .map(|s| s.digest)
            .collect();
        digests.sort();
        digest_json(&digests)
    }
}

/// Parameters rendered with sorted keys, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` name the same snapshot.
pub fn canonical_parameters(parameters: &Value) -> String {
    // serde_json's default Map is ordered by key
    parameters.to_string()
}

/// SHA-256 hex digest of a value's JSON encoding, streamed into the hasher
pub fn digest_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//! The key-value application built on top of consensus, ported from
//! `kv_service.go`. The wire-level op encoding and `djb2` hash are reproduced
//! verbatim; the encoding is internal to this module, not the consensus core.

use crate::group::GroupHandle;
use crate::statemachine::StateMachine;
use crate::PaxosError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KvOp {
    Set = 1,
    Del = 2,
    Get = 3,
}

impl KvOp {
    fn from_i32(v: i32) -> Option<KvOp> {
        match v {
            1 => Some(KvOp::Set),
            2 => Some(KvOp::Del),
            3 => Some(KvOp::Get),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KvOpInfo {
    op: KvOp,
    key: String,
    value: String,
    version: i32,
}

/// `op=<int> key=<token> val=<token> ver=<int>`, ported from `serializeOpInfo`.
fn serialize_op(info: &KvOpInfo) -> Vec<u8> {
    format!("op={} key={} val={} ver={}", info.op as i32, info.key, info.value, info.version).into_bytes()
}

/// Ported from `unserializeOpInfo`'s `Sscanf` parse; returns `None` on any
/// malformed record instead of partially filling one.
fn deserialize_op(blob: &[u8]) -> Option<KvOpInfo> {
    let text = std::str::from_utf8(blob).ok()?;
    let mut op = None;
    let mut key = None;
    let mut value = None;
    let mut version = None;

    for field in text.split_whitespace() {
        let (name, val) = field.split_once('=')?;
        match name {
            "op" => op = val.parse::<i32>().ok().and_then(KvOp::from_i32),
            "key" => key = Some(val.to_string()),
            "val" => value = Some(val.to_string()),
            "ver" => version = val.parse::<i32>().ok(),
            _ => return None,
        }
    }

    Some(KvOpInfo { op: op?, key: key?, value: value?, version: version? })
}

/// `djb2` with multiplier 33 and no XOR, exactly `djbhash` in `kv_service.go`.
pub fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 0;
    for b in s.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(b as u64);
    }
    hash
}

/// The opaque collaborator applied by every replica's learner. Guarded by a plain
/// `std::sync::RwLock`: `apply` never suspends, so a blocking lock held for its
/// whole (short) duration is both correct and simpler than an async one, while
/// `get_local` can take the read side from any client-handling task.
pub struct KeyValueStore {
    storage: RwLock<HashMap<String, (String, i32)>>,
}

impl Default for KeyValueStore {
    fn default() -> KeyValueStore {
        KeyValueStore { storage: RwLock::new(HashMap::new()) }
    }
}

impl KeyValueStore {
    pub fn new() -> KeyValueStore {
        KeyValueStore::default()
    }

    pub fn get_local(&self, key: &str) -> Option<(String, i32)> {
        self.storage.read().unwrap().get(key).cloned()
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&self, blob: &[u8]) -> Vec<u8> {
        let Some(mut info) = deserialize_op(blob) else {
            return Vec::new();
        };

        match info.op {
            KvOp::Set => {
                let mut storage = self.storage.write().unwrap();
                match storage.get(&info.key) {
                    Some((value, version)) if *version != info.version => {
                        info.value = value.clone();
                        info.version = *version;
                    }
                    _ => {
                        storage.insert(info.key.clone(), (info.value.clone(), info.version));
                    }
                }
                serialize_op(&info)
            }
            KvOp::Del => {
                let mut storage = self.storage.write().unwrap();
                match storage.get(&info.key) {
                    // Fixes a source hazard: `kv_service.go`'s Del branch
                    // dereferences the (possibly nil) old value unconditionally
                    // once the version check passes. A missing key has nothing
                    // to delete, so it is reported back unmodified instead.
                    None => serialize_op(&info),
                    Some((value, version)) if *version != info.version => {
                        info.value = value.clone();
                        info.version = *version;
                        serialize_op(&info)
                    }
                    Some((value, _)) => {
                        info.value = value.clone();
                        storage.remove(&info.key);
                        serialize_op(&info)
                    }
                }
            }
            KvOp::Get => {
                let storage = self.storage.read().unwrap();
                match storage.get(&info.key) {
                    None => serialize_op(&info),
                    Some((value, version)) => {
                        info.value = value.clone();
                        info.version = *version;
                        serialize_op(&info)
                    }
                }
            }
        }
    }
}

/// Client-facing wrapper routing Set/Del/Get through the right instance group,
/// ported from `KVService`.
pub struct KvService {
    groups: Vec<GroupHandle>,
    store: std::sync::Arc<KeyValueStore>,
}

impl KvService {
    pub fn new(groups: Vec<GroupHandle>, store: std::sync::Arc<KeyValueStore>) -> KvService {
        KvService { groups, store }
    }

    fn group_for(&self, key: &str) -> &GroupHandle {
        let idx = (djb2(key) % self.groups.len() as u64) as usize;
        &self.groups[idx]
    }

    async fn commit(&self, info: KvOpInfo) -> Result<(String, i32), PaxosError> {
        let result = self.group_for(&info.key).commit(Bytes::from(serialize_op(&info))).await?;
        match deserialize_op(&result) {
            Some(out) => Ok((out.value, out.version)),
            None => Ok((String::new(), 0)),
        }
    }

    pub async fn set(&self, key: &str, value: &str, version: i32) -> Result<(String, i32), PaxosError> {
        self.commit(KvOpInfo { op: KvOp::Set, key: key.to_string(), value: value.to_string(), version }).await
    }

    pub async fn del(&self, key: &str, version: i32) -> Result<(String, i32), PaxosError> {
        self.commit(KvOpInfo { op: KvOp::Del, key: key.to_string(), value: "*".to_string(), version }).await
    }

    pub async fn get_global(&self, key: &str) -> Result<(String, i32), PaxosError> {
        self.commit(KvOpInfo { op: KvOp::Get, key: key.to_string(), value: "*".to_string(), version: 0 }).await
    }

    /// Reads from this replica's own storage; no ordering guarantee against
    /// concurrent writes elsewhere in the cluster.
    pub fn get_local(&self, key: &str) -> Option<(String, i32)> {
        self.store.get_local(key)
    }
}

//! The last known state of every device.
//!
//! Fed by the retained `state` messages, so after a (re)connection the
//! broker replays what the cache needs to be authoritative again.
//! Entries are sharded by device id: updates for one device serialize on
//! its shard, devices on different shards never contend.

use rtk_api::envelope::Envelope;
use rtk_api::envelope::StatePayload;
use rtk_api::topics::DeviceTopicId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

/// One cached device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub device: String,
    pub tenant: String,
    pub site: String,
    pub state: StatePayload,

    /// Envelope timestamp of the message that set this entry.
    pub updated_at: i64,
}

#[derive(Default)]
pub struct DeviceStateCache {
    shards: Vec<Mutex<HashMap<String, CachedState>>>,
}

impl DeviceStateCache {
    pub fn new() -> Self {
        DeviceStateCache {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Record the state carried by a decoded `state` message.
    ///
    /// Stale messages (an envelope older than the cached entry) are
    /// ignored: the broker may replay a retained state after fresher
    /// live updates.
    pub fn update(&self, device: &DeviceTopicId, envelope: &Envelope<StatePayload>) {
        let mut shard = self.shard(device.device_id()).lock().unwrap();
        let entry = shard.get(device.device_id());
        if let Some(entry) = entry {
            if envelope.ts < entry.updated_at {
                return;
            }
        }
        shard.insert(
            device.device_id().to_string(),
            CachedState {
                device: device.device_id().to_string(),
                tenant: device.tenant().to_string(),
                site: device.site().to_string(),
                state: envelope.body.clone(),
                updated_at: envelope.ts,
            },
        );
    }

    pub fn get(&self, device_id: &str) -> Option<CachedState> {
        self.shard(device_id).lock().unwrap().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, sorted by device id.
    pub fn snapshot(&self) -> Vec<CachedState> {
        let mut entries: Vec<CachedState> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().unwrap().values().cloned().collect::<Vec<_>>())
            .collect();
        entries.sort_by(|a, b| a.device.cmp(&b.device));
        entries
    }

    /// Persist the snapshot: write-to-temp then atomic rename, so a
    /// reader never observes a torn file even across a crash.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    /// Load a previously saved snapshot, replacing current content.
    pub fn load_from(&self, path: &Path) -> std::io::Result<()> {
        let bytes = std::fs::read(path)?;
        let snapshot: Vec<CachedState> = serde_json::from_slice(&bytes)?;
        for entry in snapshot {
            let mut shard = self.shard(&entry.device).lock().unwrap();
            shard.insert(entry.device.clone(), entry);
        }
        Ok(())
    }

    fn shard(&self, device_id: &str) -> &Mutex<HashMap<String, CachedState>> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }
}

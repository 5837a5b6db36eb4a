use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::{generate_room_code, normalize_room_id, now_ms};
use crate::config::Config;
use crate::protocol::RoomSummary;
use crate::room::{self, Room, RoomCommand, RoomHandle};
use crate::storage::Storage;
use crate::ws::Publisher;

/// All live rooms, keyed by normalized id. Insert/lookup/delete go through
/// the map; everything else goes through the per-room queues, so no lock is
/// ever held across a room command.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    config: Arc<Config>,
    publisher: Publisher,
    storage: Storage,
}

impl RoomRegistry {
    pub fn new(config: Arc<Config>, publisher: Publisher, storage: Storage) -> Self {
        Self { rooms: DashMap::new(), config, publisher, storage }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn get(&self, raw_id: &str) -> Option<RoomHandle> {
        let id = normalize_room_id(raw_id);
        self.rooms.get(&id).map(|entry| entry.value().clone())
    }

    /// Look up or atomically create a room. An id that normalizes to
    /// nothing gets a generated code; name and password only apply to a
    /// newly created room.
    pub fn get_or_create(
        &self,
        raw_id: &str,
        name: Option<&str>,
        password: Option<&str>,
    ) -> (String, RoomHandle) {
        let mut id = normalize_room_id(raw_id);
        if id.is_empty() {
            id = loop {
                let code = generate_room_code();
                if !self.rooms.contains_key(&code) {
                    break code;
                }
            };
        }

        let handle = self
            .rooms
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!("🏠 Room {} created", id);
                let room = Room::new(
                    id.clone(),
                    name,
                    password,
                    &self.config,
                    self.publisher.clone(),
                    now_ms(),
                );
                room::spawn(room, &self.config)
            })
            .value()
            .clone();
        (id, handle)
    }

    /// Summaries of rooms worth advertising: someone is in them.
    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let handles: Vec<RoomHandle> =
            self.rooms.iter().map(|entry| entry.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(status) = handle.status().await {
                if status.member_count > 0 {
                    out.push(status.summary);
                }
            }
        }
        out
    }

    /// One idle sweep: rooms that have been empty past the TTL are
    /// destroyed, and only then is their storage released.
    pub async fn cleanup(&self) {
        let ttl_ms = self.config.room_idle_ttl.as_millis() as u64;
        let now = now_ms();
        let entries: Vec<(String, RoomHandle)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (id, handle) in entries {
            match handle.status().await {
                Some(status)
                    if status.member_count == 0
                        && now.saturating_sub(status.last_active_at) > ttl_ms =>
                {
                    tracing::info!("Room {} idle past TTL, evicting", id);
                    self.destroy(&id, None).await;
                }
                Some(_) => {}
                None => {
                    // The room task is gone; drop the stale handle.
                    self.rooms.remove(&id);
                }
            }
        }
    }

    pub async fn destroy(&self, id: &str, notice: Option<String>) {
        if let Some((_, handle)) = self.rooms.remove(id) {
            handle.send(RoomCommand::Shutdown { notice });
        }
        self.storage.remove_room_dir(id).await;
    }

    /// Periodic idle-room eviction, every `cleanup_interval`.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let every = registry.config.cleanup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.cleanup().await;
            }
        })
    }
}

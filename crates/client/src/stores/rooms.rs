//! Rooms list cache shared by every view of the rooms list.

use std::sync::RwLock;
use std::time::Duration;

use relaychat_shared::Room;
use tokio::time::Instant;

#[derive(Debug)]
struct CachedRooms {
    fetched_at: Instant,
    rooms: Vec<Room>,
}

/// Last fetched rooms list, served until it is older than the TTL.
#[derive(Debug)]
pub struct RoomsCache {
    ttl: Duration,
    entry: RwLock<Option<CachedRooms>>,
}

impl RoomsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Cached rooms, if fresh.
    pub fn get(&self) -> Option<Vec<Room>> {
        let entry = self.entry.read().unwrap_or_else(|p| p.into_inner());
        entry
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.rooms.clone())
    }

    pub fn put(&self, rooms: Vec<Room>) {
        *self.entry.write().unwrap_or_else(|p| p.into_inner()) = Some(CachedRooms {
            fetched_at: Instant::now(),
            rooms,
        });
    }

    /// Replace one room in the cached list, keeping its age.
    pub fn update_room(&self, room: &Room) {
        let mut entry = self.entry.write().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = entry.as_mut() {
            match cached.rooms.iter_mut().find(|r| r.id == room.id) {
                Some(existing) => *existing = room.clone(),
                None => cached.rooms.push(room.clone()),
            }
        }
    }

    pub fn invalidate(&self) {
        *self.entry.write().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

use crate::error::Result;
use crate::room::Room;
use crate::types::RoomId;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

type RoomSlot = Arc<OnceCell<Arc<Room>>>;

/// Live rooms of one server instance
///
/// Every room id owns a slot that is filled at most once, so concurrent
/// joins of a new room id end up in the same room while unrelated ids are
/// created in parallel.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, RoomSlot>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    /// Open room with this id, if any
    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
            .filter(|room| !room.is_closed())
    }

    /// Return the open room `room_id`, creating it with `create` if needed.
    /// `create` runs at most once per missing room.
    pub async fn get_or_create<F, Fut>(self: &Arc<Self>, room_id: &RoomId, create: F) -> Result<Arc<Room>>
    where
        F: FnOnce(Weak<Self>) -> Fut,
        Fut: Future<Output = Result<Arc<Room>>>,
    {
        let slot = self.slot(room_id);
        let mut created = false;
        let filled = slot
            .get_or_try_init(|| {
                created = true;
                create(Arc::downgrade(self))
            })
            .await;

        match filled {
            Ok(room) => {
                if created {
                    debug!(room_id = %room_id, rooms = self.len(), "Room registered");
                }
                Ok(Arc::clone(room))
            }
            Err(e) => {
                // Nobody else is waiting on the slot: drop it rather than
                // leave an empty one behind.
                self.rooms.remove_if(room_id, |_, registered| {
                    Arc::ptr_eq(registered, &slot)
                        && registered.get().is_none()
                        && Arc::strong_count(registered) == 2
                });
                Err(e)
            }
        }
    }

    /// Slot for `room_id`; a slot holding a closed room is replaced
    fn slot(&self, room_id: &RoomId) -> RoomSlot {
        let mut entry = self.rooms.entry(room_id.clone()).or_default();
        if entry.value().get().is_some_and(|room| room.is_closed()) {
            *entry.value_mut() = RoomSlot::default();
        }
        Arc::clone(entry.value())
    }

    /// Drop `room` from the registry unless a newer room already took its id
    pub(crate) fn evict(&self, room: &Room) {
        let removed = self.rooms.remove_if(room.id(), |_, registered| {
            registered
                .get()
                .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), room))
        });
        if removed.is_some() {
            debug!(room_id = %room.id(), "Room evicted");
        }
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    /// Registered rooms; slots still being created are not counted
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

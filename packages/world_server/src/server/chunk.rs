//! See `Chunk`.

use crate::{
    server::{
        save_content::ObjectWrite,
        storage::{
            Storage,
            StorageError,
        },
    },
    util_abort_handle::AbortGuard,
};
use chunk_data::*;
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    mem::{
        replace,
        take,
    },
};


/// Owns the live game objects located in one chunk cell, and tracks what happened to them this
/// tick.
///
/// A chunk begins loading when created. Objects handed to it before its load lands wait in a queue
/// and are inserted on top of the stored objects once it does, so no read ever observes a partial
/// object set. Once loaded, a chunk stays loaded.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    state: LoadState,
    // objects mutated this tick
    updated: BTreeSet<ObjectId>,
    // objects which left this chunk this tick
    removed: BTreeSet<ObjectId>,
    // writes owed to storage since the last flush
    unsaved: BTreeMap<ObjectId, ObjectWrite>,
}

#[derive(Debug)]
enum LoadState {
    Loading {
        // aborts the load job if the chunk is dropped first
        #[allow(dead_code)]
        aborted: AbortGuard,
        waiting: Vec<GameObject>,
    },
    Loaded {
        objects: BTreeMap<ObjectId, GameObject>,
    },
    Failed {
        waiting: Vec<GameObject>,
    },
}

/// Result of moving an object within the chunk that owns it.
#[derive(Debug)]
pub enum Migration {
    /// The object stayed within this chunk.
    Local,
    /// The object crossed into another chunk and was removed from this one. Its `chunk_id`
    /// names the destination.
    Departed(GameObject),
    /// The chunk isn't loaded or doesn't own the object, so nothing happened.
    Missing,
}

impl Chunk {
    /// Construct in the loading state, holding the guard of its load job.
    pub fn new_loading(id: ChunkId, aborted: AbortGuard) -> Self {
        Chunk {
            id,
            state: LoadState::Loading {
                aborted,
                waiting: Vec::new(),
            },
            updated: Default::default(),
            removed: Default::default(),
            unsaved: Default::default(),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&self.state, &LoadState::Loaded { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(&self.state, &LoadState::Loading { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(&self.state, &LoadState::Failed { .. })
    }

    /// Go back into the loading state after a failed load, keeping any waiting objects.
    pub fn retry_load(&mut self, aborted: AbortGuard) {
        if let LoadState::Failed { waiting } = &mut self.state {
            let waiting = take(waiting);
            self.state = LoadState::Loading { aborted, waiting };
        }
    }

    /// Transition to loaded with the objects read from storage. Objects added while loading
    /// override their stored copies.
    ///
    /// Ignored unless loading.
    pub fn on_loaded(&mut self, stored: Vec<GameObject>) {
        let waiting = match &mut self.state {
            LoadState::Loading { waiting, .. } => take(waiting),
            _ => {
                warn!(chunk_id=%self.id, "chunk load result arrived for chunk not loading");
                return;
            }
        };
        let mut objects = BTreeMap::new();
        for obj in stored.into_iter().chain(waiting) {
            objects.insert(obj.id, obj);
        }
        trace!(chunk_id=%self.id, num_objects=objects.len(), "chunk loaded");
        self.state = LoadState::Loaded { objects };
    }

    /// Transition to failed, keeping any waiting objects for the next attempt.
    pub fn on_load_failed(&mut self) {
        let waiting = match replace(&mut self.state, LoadState::Failed { waiting: Vec::new() }) {
            LoadState::Loading { waiting, .. } | LoadState::Failed { waiting } => waiting,
            loaded @ LoadState::Loaded { .. } => {
                self.state = loaded;
                return;
            }
        };
        self.state = LoadState::Failed { waiting };
    }

    /// Take ownership of an object, which becomes located in this chunk.
    ///
    /// If the chunk isn't loaded yet the object waits until it is.
    pub fn add_object(&mut self, mut obj: GameObject) {
        obj.chunk_id = self.id;
        self.updated.insert(obj.id);
        self.removed.remove(&obj.id);
        self.unsaved.insert(obj.id, ObjectWrite::of(&obj));
        match &mut self.state {
            LoadState::Loaded { objects } => {
                objects.insert(obj.id, obj);
            }
            LoadState::Loading { waiting, .. } | LoadState::Failed { waiting } => {
                waiting.retain(|waiter| waiter.id != obj.id);
                waiting.push(obj);
            }
        }
    }

    /// Get an object, if loaded and located here.
    pub fn get(&self, id: ObjectId) -> Option<&GameObject> {
        match &self.state {
            LoadState::Loaded { objects } => objects.get(&id),
            _ => None,
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Get an object this chunk is responsible for, whether live or waiting for the load.
    pub fn holding(&self, id: ObjectId) -> Option<&GameObject> {
        match &self.state {
            LoadState::Loaded { objects } => objects.get(&id),
            LoadState::Loading { waiting, .. } | LoadState::Failed { waiting } => waiting
                .iter()
                .find(|obj| obj.id == id),
        }
    }

    /// Move an object located here to a new position.
    ///
    /// If the position is in another chunk, the object is removed from this chunk and handed
    /// back to the caller for delivery to its destination. The storage write for it then
    /// becomes the destination's to make, see `retain_write`.
    pub fn update_position(&mut self, id: ObjectId, position: Position) -> Migration {
        let objects = match &mut self.state {
            LoadState::Loaded { objects } => objects,
            _ => return Migration::Missing,
        };
        let obj = match objects.get_mut(&id) {
            Some(obj) => obj,
            None => return Migration::Missing,
        };

        obj.position = position;
        let destination = chunk_id_of(position);
        if destination == self.id {
            self.updated.insert(id);
            self.unsaved.insert(id, ObjectWrite::of(obj));
            return Migration::Local;
        }

        let mut obj = match objects.remove(&id) {
            Some(obj) => obj,
            None => return Migration::Missing,
        };
        obj.chunk_id = destination;
        self.updated.remove(&id);
        self.unsaved.remove(&id);
        self.removed.insert(id);
        Migration::Departed(obj)
    }

    /// Keep owing storage a write for an object which departed this chunk but had no live
    /// destination to take responsibility for it.
    pub fn retain_write(&mut self, write: ObjectWrite) {
        self.unsaved.insert(write.id, write);
    }

    /// Mutate non-positional state of an object located here, marking it updated.
    ///
    /// Returns false if the object isn't here.
    pub fn update_object<F>(&mut self, id: ObjectId, f: F) -> bool
    where
        F: FnOnce(&mut GameObject),
    {
        let obj = match &mut self.state {
            LoadState::Loaded { objects } => objects.get_mut(&id),
            _ => None,
        };
        match obj {
            Some(obj) => {
                f(obj);
                self.updated.insert(id);
                true
            }
            None => false,
        }
    }

    /// Formatted versions of every object located here, except the one with the given id.
    pub fn objects_except(&self, except: ObjectId) -> impl Iterator<Item=FormattedObject> + '_ {
        let objects = match &self.state {
            LoadState::Loaded { objects } => Some(objects),
            _ => None,
        };
        objects
            .into_iter()
            .flat_map(|objects| objects.values())
            .filter(move |obj| obj.id != except)
            .map(GameObject::format)
    }

    /// Formatted versions of the objects mutated this tick, except the one with the given id.
    pub fn updated_except(&self, except: ObjectId) -> impl Iterator<Item=FormattedObject> + '_ {
        self.updated
            .iter()
            .filter(move |&&id| id != except)
            .filter_map(move |&id| self.get(id))
            .map(GameObject::format)
    }

    /// Ids of objects which left this chunk this tick.
    #[cfg(test)]
    pub fn removed(&self) -> impl Iterator<Item=ObjectId> + '_ {
        self.removed.iter().copied()
    }

    /// Ids of objects which left this chunk this tick, except the one with the given id.
    pub fn removed_except(&self, except: ObjectId) -> impl Iterator<Item=ObjectId> + '_ {
        self.removed.iter().copied().filter(move |&id| id != except)
    }

    /// Whether the object with the given id was mutated here this tick.
    pub fn is_updated(&self, id: ObjectId) -> bool {
        self.updated.contains(&id)
    }

    /// Whether anything other than the given object changed here this tick.
    pub fn has_changes_except(&self, except: ObjectId) -> bool {
        self.removed_except(except).next().is_some()
            || self.updated.iter().any(|&id| id != except)
    }

    /// Number of objects owed to storage.
    pub fn unsaved_len(&self) -> usize {
        self.unsaved.len()
    }

    /// Forget this tick's per-tick bookkeeping. Call once per tick, after broadcasting.
    pub fn tick_clean_up(&mut self) {
        self.updated.clear();
        self.removed.clear();
    }

    /// Write every object owed to storage in one batch.
    ///
    /// On failure, the writes stay owed. Returns how many were written.
    pub fn flush_changes(&mut self, storage: &dyn Storage) -> Result<usize, StorageError> {
        if self.unsaved.is_empty() {
            return Ok(0);
        }
        let writes = self.unsaved.values().copied().collect::<Vec<_>>();
        storage.update_objects(&writes)?;
        self.unsaved.clear();
        Ok(writes.len())
    }
}

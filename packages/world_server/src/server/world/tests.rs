use super::*;
use crate::{
    config::StorageKind,
    message::*,
    server::{
        save_content::*,
        storage::MemStorage,
    },
};
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use parking_lot::Mutex;


fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.storage = StorageKind::Memory;
    config.orbit = None;
    config
}

fn new_world(config: &ServerConfig, storage: Arc<dyn Storage>) -> World {
    let (server_send, server_recv) = channel();
    World::new(config, storage, ThreadPool::with_threads(1), server_send, server_recv)
}

// transport which keeps everything sent through it
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(String, serde_json::Value)>>>);

impl Transport for Recorder {
    fn send(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.0.lock().push((event.to_owned(), payload));
        Ok(())
    }
}

impl Recorder {
    // take the world updates sent so far
    fn take_updates(&self) -> Vec<WorldUpdate> {
        take(&mut *self.0.lock())
            .into_iter()
            .map(|(event, payload)| {
                assert_eq!(event, WORLD_UPDATES_EVENT);
                serde_json::from_value(payload).unwrap()
            })
            .collect()
    }
}

// connect a player and tick once so that it's resolved
fn log_in(world: &mut World, username: &str) -> (PlayerSnapshot, Recorder) {
    let recorder = Recorder::default();
    let mut resolved = world.connect(username.to_owned(), Box::new(recorder.clone()));
    world.tick().unwrap();
    let snapshot = resolved.try_recv().unwrap().unwrap();
    (snapshot, recorder)
}

fn insert_prop(storage: &dyn Storage, x: f64, y: f64) -> ObjectId {
    storage
        .insert_object(&StoredObject::new(ObjectKind::Prop, Vec2::new(x, y), None))
        .unwrap()
}

fn live_position(world: &World, player_id: ObjectId) -> Position {
    let session = world.session(player_id).unwrap();
    world.chunk(session.chunk_id).unwrap().get(player_id).unwrap().position
}

fn diff(update: &WorldUpdate, chunk_id: ChunkId) -> Option<&ChunkDiff> {
    update.updated_chunks.iter().find(|diff| diff.id == chunk_id)
}


#[test]
fn concurrent_requests_share_one_load() {
    let storage = Arc::new(MemStorage::new());
    let prop = insert_prop(&*storage, 10.0, 10.0);
    let mut world = new_world(&test_config(), storage.clone());
    let chunk_id = ChunkId::new(0, 0);

    world.request_chunk(chunk_id);
    world.request_chunk(chunk_id);
    world.await_chunks(&[chunk_id, chunk_id]).unwrap();
    assert_eq!(storage.chunk_fetches(), 1);
    assert!(world.chunk(chunk_id).unwrap().contains(prop));

    world.await_chunks(&[chunk_id]).unwrap();
    assert_eq!(storage.chunk_fetches(), 1);
}

#[test]
fn snapshot_lists_neighborhood_except_self() {
    let storage = Arc::new(MemStorage::new());
    let near = insert_prop(&*storage, 710.0, 710.0);
    let far = insert_prop(&*storage, 1250.0, 700.0);
    let mut world = new_world(&test_config(), storage.clone());

    let (snapshot, _) = log_in(&mut world, "alice");
    assert_eq!(snapshot.chunk_id, ChunkId::new(1, 1));
    assert_eq!(snapshot.chunks_ids, neighborhood_of(ChunkId::new(1, 1)));
    assert_eq!(snapshot.position, Vec2::new(700.0, 700.0));
    assert_eq!(snapshot.chunks.len(), 9);
    let listed = snapshot.chunks
        .iter()
        .flat_map(|listing| listing.game_objects.iter().map(|obj| obj.id))
        .collect::<Vec<_>>();
    assert_eq!(listed, vec![near]);
    assert!(!listed.contains(&far));
    assert!(!listed.contains(&snapshot.player_id));
    assert_eq!(storage.find_player_by_username("alice").unwrap().unwrap().object_id, snapshot.player_id);
}

#[test]
fn silence_on_no_op() {
    let mut world = new_world(&test_config(), Arc::new(MemStorage::new()));
    let (alice, recorder) = log_in(&mut world, "alice");

    world.tick().unwrap();
    world.tick().unwrap();
    assert!(recorder.take_updates().is_empty());

    world.set_move_target(alice.player_id, Vec2::new(705.0, 700.0));
    world.tick().unwrap();
    let updates = recorder.take_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].position, Vec2::new(705.0, 700.0));
    assert!(updates[0].updated_chunks.is_empty());

    world.tick().unwrap();
    assert!(recorder.take_updates().is_empty());
}

#[test]
fn movement_is_clamped_to_one_step() {
    let mut world = new_world(&test_config(), Arc::new(MemStorage::new()));
    let (alice, recorder) = log_in(&mut world, "alice");

    world.set_move_target(alice.player_id, Vec2::new(800.0, 700.0));
    world.tick().unwrap();

    let position = live_position(&world, alice.player_id);
    assert!((position.x - 706.66).abs() < 1e-9);
    assert_eq!(position.y, 700.0);
    assert_eq!(recorder.take_updates()[0].position, position);
    assert!(world.session(alice.player_id).unwrap().move_target.is_some());
}

#[test]
fn walk_reaches_target_exactly() {
    let config = test_config();
    let mut world = new_world(&config, Arc::new(MemStorage::new()));
    let (alice, _) = log_in(&mut world, "alice");

    let target = Vec2::new(760.0, 700.0);
    let step = config.player_speed * config.tick_interval().as_secs_f64();
    let expected_ticks = (60.0 / step).ceil() as usize;
    assert_eq!(expected_ticks, 10);

    world.set_move_target(alice.player_id, target);
    let mut ticks = 0;
    while world.session(alice.player_id).unwrap().move_target.is_some() {
        world.tick().unwrap();
        ticks += 1;
        assert!(ticks <= expected_ticks);
    }
    assert_eq!(ticks, expected_ticks);
    assert_eq!(live_position(&world, alice.player_id), target);
}

#[test]
fn new_chunk_gets_full_listing() {
    let storage = Arc::new(MemStorage::new());
    let prop = insert_prop(&*storage, 1250.0, 100.0);
    let mut config = test_config();
    config.spawn = Vec2::new(790.0, 100.0);
    config.player_speed = 100.0;
    let mut world = new_world(&config, storage.clone());
    let (alice, recorder) = log_in(&mut world, "alice");
    assert!(world.chunk(ChunkId::new(3, 0)).is_none());

    world.set_move_target(alice.player_id, Vec2::new(810.0, 100.0));
    world.tick().unwrap();

    let updates = recorder.take_updates();
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.position, Vec2::new(810.0, 100.0));
    assert_eq!(update.chunks_ids, neighborhood_of(ChunkId::new(2, 0)));
    assert_eq!(update.updated_chunks.len(), 3);
    let listing = diff(update, ChunkId::new(3, 0)).unwrap();
    assert_eq!(listing.updated.iter().map(|obj| obj.id).collect::<Vec<_>>(), vec![prop]);
    assert_eq!(listing.updated[0].kind, ObjectKind::Prop);
    assert!(listing.removed.is_empty());
    assert!(diff(update, ChunkId::new(3, -1)).unwrap().updated.is_empty());

    let session = world.session(alice.player_id).unwrap();
    assert_eq!(session.chunk_id, ChunkId::new(2, 0));
    assert!(session.new_chunks.is_empty());

    world.tick().unwrap();
    assert!(recorder.take_updates().is_empty());
}

#[test]
fn migration_moves_object_between_chunks() {
    let mut config = test_config();
    config.spawn = Vec2::new(390.0, 100.0);
    config.player_speed = 100.0;
    let mut world = new_world(&config, Arc::new(MemStorage::new()));
    let from = ChunkId::new(0, 0);
    let to = ChunkId::new(1, 0);

    let (alice, alice_recorder) = log_in(&mut world, "alice");
    let (bob, bob_recorder) = log_in(&mut world, "bob");
    alice_recorder.take_updates();
    bob_recorder.take_updates();

    world.set_move_target(alice.player_id, Vec2::new(420.0, 100.0));
    let mut dave = world.connect("dave".into(), Box::new(Recorder::default()));
    world.tick().unwrap();

    assert!(!world.chunk(from).unwrap().contains(alice.player_id));
    assert!(world.chunk(to).unwrap().contains(alice.player_id));
    assert_eq!(world.chunk(to).unwrap().get(alice.player_id).unwrap().chunk_id, to);
    assert_eq!(world.session(alice.player_id).unwrap().chunk_id, to);

    let updates = bob_recorder.take_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(diff(&updates[0], from).unwrap().removed, vec![alice.player_id]);
    let arrived = &diff(&updates[0], to).unwrap().updated;
    assert_eq!(arrived.len(), 1);
    assert_eq!(arrived[0].id, alice.player_id);
    assert_eq!(arrived[0].position, Vec2::new(420.0, 100.0));

    let dave = dave.try_recv().unwrap().unwrap();
    let listing = |chunk_id: ChunkId| dave.chunks
        .iter()
        .find(|listing: &&ChunkListing| listing.id == chunk_id)
        .unwrap()
        .game_objects
        .iter()
        .map(|obj| obj.id)
        .collect::<Vec<_>>();
    assert_eq!(listing(to), vec![alice.player_id]);
    assert!(!listing(from).contains(&alice.player_id));
    assert!(listing(from).contains(&bob.player_id));

    // the departure is reported for exactly one tick
    world.tick().unwrap();
    assert_eq!(world.chunk(from).unwrap().removed().count(), 0);
    for update in bob_recorder.take_updates() {
        assert!(update.updated_chunks.iter().all(|diff| diff.removed.is_empty()));
    }
}

#[test]
fn object_moved_into_unrequested_chunk_is_saved_there() {
    let storage = Arc::new(MemStorage::new());
    let prop = insert_prop(&*storage, 390.0, 100.0);
    let mut world = new_world(&test_config(), storage.clone());
    let from = ChunkId::new(0, 0);
    let to = ChunkId::new(1, 0);
    world.await_chunks(&[from]).unwrap();

    assert_eq!(world.move_object(from, prop, Vec2::new(420.0, 100.0)), Some(to));
    assert!(!world.chunk(from).unwrap().contains(prop));
    assert!(world.chunk(to).is_none());

    world.flush().unwrap();
    let stored = storage.stored(prop).unwrap();
    assert_eq!(stored.chunk_id, to);
    assert_eq!(stored.position, Vec2::new(420.0, 100.0));
    assert_eq!(world.chunk(from).unwrap().unsaved_len(), 0);

    world.await_chunks(&[to]).unwrap();
    assert_eq!(world.chunk(to).unwrap().get(prop).unwrap().position, Vec2::new(420.0, 100.0));
}

#[test]
fn persistence_is_one_write_per_touched_object() {
    let storage = Arc::new(MemStorage::new());
    let mut world = new_world(&test_config(), storage.clone());
    let players = ["alice", "bob", "carol"]
        .into_iter()
        .map(|username| log_in(&mut world, username).0.player_id)
        .collect::<Vec<_>>();
    world.tick().unwrap();
    let home = ChunkId::new(1, 1);
    assert_eq!(world.chunk(home).unwrap().unsaved_len(), 0);
    let baseline = storage.object_updates();

    for (i, &player_id) in players.iter().enumerate() {
        world.set_move_target(player_id, Vec2::new(700.0 + i as f64, 720.0));
    }
    world.tick().unwrap();

    assert_eq!(storage.object_updates() - baseline, 3);
    assert_eq!(world.chunk(home).unwrap().unsaved_len(), 0);
    for &player_id in &players {
        assert_eq!(storage.stored(player_id).unwrap().position, live_position(&world, player_id));
    }
}

#[test]
fn chat_reaches_neighbors_without_saving() {
    let storage = Arc::new(MemStorage::new());
    let mut world = new_world(&test_config(), storage.clone());
    let (alice, _) = log_in(&mut world, "alice");
    let (_, bob_recorder) = log_in(&mut world, "bob");
    world.tick().unwrap();
    bob_recorder.take_updates();
    let baseline = storage.object_updates();

    world.update_text_from(alice.player_id, "hello".into());
    world.tick().unwrap();

    let home = world.chunk(ChunkId::new(1, 1)).unwrap();
    assert_eq!(home.get(alice.player_id).unwrap().chat_message.as_deref(), Some("hello"));
    let updates = bob_recorder.take_updates();
    assert_eq!(updates.len(), 1);
    let updated = &diff(&updates[0], ChunkId::new(1, 1)).unwrap().updated;
    assert_eq!(updated[0].id, alice.player_id);
    assert_eq!(storage.object_updates(), baseline);
}

#[test]
fn orbiting_npc_follows_its_script() {
    let storage = Arc::new(MemStorage::new());
    let mut config = test_config();
    config.orbit = Some(Default::default());
    let mut world = new_world(&config, storage.clone());
    world.seed(&config).unwrap();
    let npc = ObjectId(1);
    assert_eq!(storage.stored(npc).unwrap().position, Vec2::new(780.0, 650.0));

    let (_, recorder) = log_in(&mut world, "alice");
    world.tick().unwrap();

    let home = world.chunk(ChunkId::new(1, 1)).unwrap();
    assert_eq!(home.get(npc).unwrap().position, Vec2::new(777.0, 666.0));
    let updates = recorder.take_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(diff(&updates[0], ChunkId::new(1, 1)).unwrap().updated[0].id, npc);

    let mut restarted = new_world(&config, storage.clone());
    restarted.seed(&config).unwrap();
    assert!(storage.stored(ObjectId(3)).is_none());
}

#[test]
fn returning_player_resumes_where_they_left() {
    let storage = Arc::new(MemStorage::new());
    let mut world = new_world(&test_config(), storage.clone());
    let (alice, _) = log_in(&mut world, "alice");
    world.set_move_target(alice.player_id, Vec2::new(710.0, 700.0));
    world.tick().unwrap();
    world.tick().unwrap();
    world.disconnect(alice.player_id);
    assert!(world.session(alice.player_id).is_none());
    drop(world);

    let mut world = new_world(&test_config(), storage.clone());
    let (again, _) = log_in(&mut world, "alice");
    assert_eq!(again.player_id, alice.player_id);
    assert_eq!(again.position, Vec2::new(710.0, 700.0));
}

#[test]
fn abandoned_request_leaves_no_session() {
    let mut world = new_world(&test_config(), Arc::new(MemStorage::new()));
    drop(world.connect("alice".into(), Box::new(Recorder::default())));
    world.tick().unwrap();
    assert!(world.session(ObjectId(1)).is_none());
}


// storage which can be made to fail everything but player lookups
struct FlakyStorage {
    inner: MemStorage,
    failing: AtomicBool,
}

impl FlakyStorage {
    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("flaky".into()))
        } else {
            Ok(())
        }
    }
}

impl Storage for FlakyStorage {
    fn find_objects_by_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GameObject>, StorageError> {
        self.check()?;
        self.inner.find_objects_by_chunk(chunk_id)
    }

    fn find_object(&self, id: ObjectId) -> Result<Option<GameObject>, StorageError> {
        self.inner.find_object(id)
    }

    fn find_object_by_kind(&self, kind: ObjectKind) -> Result<Option<GameObject>, StorageError> {
        self.inner.find_object_by_kind(kind)
    }

    fn insert_object(&self, record: &StoredObject) -> Result<ObjectId, StorageError> {
        self.inner.insert_object(record)
    }

    fn update_object_position_and_chunk(&self, write: &ObjectWrite) -> Result<(), StorageError> {
        self.check()?;
        self.inner.update_object_position_and_chunk(write)
    }

    fn find_player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StorageError> {
        self.inner.find_player_by_username(username)
    }

    fn insert_player(&self, record: &PlayerRecord) -> Result<(), StorageError> {
        self.inner.insert_player(record)
    }
}

fn flaky_storage() -> Arc<FlakyStorage> {
    Arc::new(FlakyStorage {
        inner: MemStorage::new(),
        failing: AtomicBool::new(false),
    })
}

#[test]
fn storage_failures_escalate_only_when_consecutive() {
    let storage = flaky_storage();
    let mut config = test_config();
    config.max_storage_failures = 3;
    let mut world = new_world(&config, storage.clone());
    let (alice, _) = log_in(&mut world, "alice");
    let home = ChunkId::new(1, 1);
    world.set_move_target(alice.player_id, Vec2::new(780.0, 700.0));

    storage.failing.store(true, Ordering::SeqCst);
    world.tick().unwrap();
    world.tick().unwrap();
    assert_eq!(world.chunk(home).unwrap().unsaved_len(), 1);

    storage.failing.store(false, Ordering::SeqCst);
    world.tick().unwrap();
    assert_eq!(world.chunk(home).unwrap().unsaved_len(), 0);
    assert_eq!(
        storage.inner.stored(alice.player_id).unwrap().position,
        live_position(&world, alice.player_id),
    );

    storage.failing.store(true, Ordering::SeqCst);
    world.tick().unwrap();
    world.tick().unwrap();
    let e = world.tick().unwrap_err();
    assert!(e.downcast_ref::<StorageError>().is_some());
}

#[test]
fn failed_chunk_is_listed_once_it_loads() {
    let storage = flaky_storage();
    let prop = insert_prop(&storage.inner, 1250.0, 100.0);
    let mut config = test_config();
    config.spawn = Vec2::new(790.0, 100.0);
    config.player_speed = 100.0;
    config.max_storage_failures = 10;
    let mut world = new_world(&config, storage.clone());
    let (alice, recorder) = log_in(&mut world, "alice");
    let entered = ChunkId::new(3, 0);

    storage.failing.store(true, Ordering::SeqCst);
    world.set_move_target(alice.player_id, Vec2::new(810.0, 100.0));
    world.tick().unwrap();
    assert!(world.chunk(entered).unwrap().is_failed());
    let updates = recorder.take_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].position, Vec2::new(810.0, 100.0));
    assert!(diff(&updates[0], entered).is_none());
    assert!(world.session(alice.player_id).unwrap().new_chunks.contains(&entered));

    storage.failing.store(false, Ordering::SeqCst);
    world.tick().unwrap();
    assert!(world.chunk(entered).unwrap().is_loaded());
    let updates = recorder.take_updates();
    assert_eq!(updates.len(), 1);
    let listing = diff(&updates[0], entered).unwrap();
    assert_eq!(listing.updated.iter().map(|obj| obj.id).collect::<Vec<_>>(), vec![prop]);
    assert!(world.session(alice.player_id).unwrap().new_chunks.is_empty());

    world.tick().unwrap();
    assert!(recorder.take_updates().is_empty());
}

#[test]
fn returning_player_resumes_from_unsaved_live_copy() {
    let storage = flaky_storage();
    let mut config = test_config();
    config.spawn = Vec2::new(390.0, 100.0);
    config.player_speed = 100.0;
    config.max_storage_failures = 20;
    let mut world = new_world(&config, storage.clone());
    let (alice, _) = log_in(&mut world, "alice");
    let saved = ChunkId::new(0, 0);
    let live = ChunkId::new(1, 0);

    storage.failing.store(true, Ordering::SeqCst);
    world.set_move_target(alice.player_id, Vec2::new(420.0, 100.0));
    world.tick().unwrap();
    world.disconnect(alice.player_id);
    assert_eq!(storage.inner.stored(alice.player_id).unwrap().chunk_id, saved);

    let (again, _) = log_in(&mut world, "alice");
    assert_eq!(again.player_id, alice.player_id);
    assert_eq!(again.chunk_id, live);
    assert_eq!(again.position, Vec2::new(420.0, 100.0));
    assert!(!world.chunk(saved).unwrap().contains(alice.player_id));
    assert!(world.chunk(live).unwrap().contains(alice.player_id));
}

use extguard_schema::ClusterExtension;
use extguard_store::{
    EventType, ExtensionStore, MemoryStore, Next, SnapshotFile, StoreError, StoredState,
};
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn unique_store_admits_one_of_many_concurrent_claimants() {
    const WRITERS: usize = 64;
    let store = Arc::new(MemoryStore::new().with_unique_packages(true));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.create(&ClusterExtension::new(format!("w-{i}"), "pkg-x"))
            })
        })
        .collect();

    let mut admitted = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.join().unwrap() {
            Ok(_) => admitted += 1,
            Err(StoreError::IdentifierConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, WRITERS - 1);
}

#[test]
fn concurrent_writers_produce_gapless_ordered_feed() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 25;
    let store = Arc::new(MemoryStore::new());
    let stream = store.watch(0).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    store
                        .create(&ClusterExtension::new(format!("w{w}-{i}"), format!("p{w}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut expected = 1;
    while expected <= (WRITERS * PER_WRITER) as u64 {
        match stream.next_timeout(Duration::from_secs(5)) {
            Next::Event(event) => {
                assert_eq!(event.revision, expected);
                assert_eq!(event.kind, EventType::Added);
                expected += 1;
            }
            other => panic!("feed ended early at rev {expected}: {other:?}"),
        }
    }
}

#[test]
fn resumed_watch_sees_only_later_events() {
    let store = MemoryStore::new();
    store.create(&ClusterExtension::new("a", "p1")).unwrap();
    let snapshot = store.list().unwrap();

    let version = snapshot.items[0].version().unwrap();
    store
        .update(&ClusterExtension::new("a", "p2"), version)
        .unwrap();
    store.delete(&"a".into()).unwrap();

    let kinds: Vec<_> = store
        .watch(snapshot.revision)
        .unwrap()
        .take(2)
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EventType::Modified, EventType::Deleted]);
}

#[test]
fn tampered_snapshot_is_refused_on_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MemoryStore::open(dir.path()).unwrap();
        store.create(&ClusterExtension::new("a", "p1")).unwrap();
    }

    let path = SnapshotFile::new(dir.path()).path();
    let tampered = fs::read_to_string(&path).unwrap().replace("\"p1\"", "\"p9\"");
    fs::write(&path, tampered).unwrap();

    match MemoryStore::open(dir.path()) {
        Err(StoreError::IntegrityFailure { .. }) => {}
        Err(e) => panic!("expected integrity failure, got {e}"),
        Ok(_) => panic!("tampered snapshot was accepted"),
    }
}

#[test]
fn snapshot_without_checksum_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let state = StoredState {
        revision: 3,
        items: vec![ClusterExtension::new("a", "p1")],
        checksum: None,
    };
    fs::write(
        SnapshotFile::new(dir.path()).path(),
        serde_json::to_string(&state).unwrap(),
    )
    .unwrap();

    let store = MemoryStore::open(dir.path()).unwrap();
    assert_eq!(store.revision().unwrap(), 3);
    assert_eq!(store.get(&"a".into()).unwrap().package(), "p1");
}

#[test]
fn failed_persist_rolls_back_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::open(dir.path()).unwrap();
    store.create(&ClusterExtension::new("a", "p1")).unwrap();

    // A directory where the snapshot file should be makes the rename fail.
    let path = SnapshotFile::new(dir.path()).path();
    fs::remove_file(&path).unwrap();
    fs::create_dir(&path).unwrap();
    fs::write(path.join("blocker"), b"x").unwrap();

    assert!(store.create(&ClusterExtension::new("b", "p2")).is_err());
    assert_eq!(store.revision().unwrap(), 1);
    assert!(matches!(
        store.get(&"b".into()),
        Err(StoreError::NotFound(_))
    ));
}

//! Several contexts in one test process, each standing in for a process of its own.
#![cfg(target_os = "linux")]
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};

use shmkv::{
    BrokerServer, Config, Context, Error, Fixed, NameStrategy, OwnerRule, ProcessIdentifier,
    ProcessMode, StoreId,
};

fn context(root: &Path, name: &str) -> Arc<Context> {
    let mut config = Config::new(root);
    config.process_name = Some(name.to_owned());
    config.process_mode_checker = true;
    Context::initialize(config)
}

#[test]
fn same_id_same_handle() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let first = ctx.open("twice", ProcessMode::Single, None).unwrap();
    let second = ctx.open("twice", ProcessMode::Single, None).unwrap();
    assert_eq!(first.handle(), second.handle());
    assert_eq!(ctx.open_count(), 1);

    first.set_i32("answer", 42).unwrap();
    assert_eq!(second.get_i32("answer").unwrap(), Some(42));
    second.set_str("greeting", "hello").unwrap();
    assert_eq!(first.get_str("greeting").unwrap().as_deref(), Some("hello"));
}

#[test]
fn racing_opens_share_one_handle() {
    const THREADS: usize = 8;

    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let barrier = Arc::new(Barrier::new(THREADS));

    let racers: Vec<_> = (0..THREADS)
        .map(|i| {
            let (ctx, barrier) = (Arc::clone(&ctx), Arc::clone(&barrier));
            std::thread::spawn(move || {
                barrier.wait();
                let file = ctx.open("race", ProcessMode::Multi, None).unwrap();
                let anon = ctx
                    .obtain_ashmem("race-anon", 4096, ProcessMode::Multi, None)
                    .unwrap();
                file.set_i32(&format!("t{i}"), i as i32).unwrap();
                (file.handle(), anon.handle())
            })
        })
        .collect();

    let handles: HashSet<_> = racers.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(handles.len(), 1);
    assert_eq!(ctx.open_count(), 2);

    let kv = ctx.open("race", ProcessMode::Multi, None).unwrap();
    assert_eq!(kv.count().unwrap(), THREADS);
}

#[test]
fn other_mode_on_open_handle() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let kv = ctx.open("modes", ProcessMode::Multi, None).unwrap();
    let err = ctx.open("modes", ProcessMode::Single, None).unwrap_err();
    assert!(matches!(
        err,
        Error::ModeMismatch {
            requested: ProcessMode::Single,
            actual: ProcessMode::Multi,
            ..
        }
    ));

    ctx.disable_process_mode_checker();
    let again = ctx.open("modes", ProcessMode::Single, None).unwrap();
    assert_eq!(again.handle(), kv.handle());
}

#[test]
fn typed_values() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let kv = ctx.default_store(ProcessMode::Single, None).unwrap();

    kv.set_bool("b", true).unwrap();
    kv.set_i64("i", -7).unwrap();
    kv.set_f64("f", 0.5).unwrap();
    kv.set_string_set("s", ["b", "a", "b"]).unwrap();

    assert_eq!(kv.get_bool("b").unwrap(), Some(true));
    assert_eq!(kv.get_i64("i").unwrap(), Some(-7));
    assert_eq!(kv.get_f64("f").unwrap(), Some(0.5));
    // Wrong width reads as absent.
    assert_eq!(kv.get_i32("i").unwrap(), None);

    let set: BTreeSet<String> = kv.get_string_set("s").unwrap().unwrap();
    assert_eq!(set.into_iter().collect::<Vec<_>>(), ["a", "b"]);
    let set: HashSet<String> = kv.get_string_set("s").unwrap().unwrap();
    assert!(set.contains("a"));
    assert_eq!(kv.get_string_set::<Vec<String>>("b").unwrap(), None);

    kv.remove_values(["b", "i"]).unwrap();
    assert_eq!(kv.keys().unwrap(), ["f", "s"]);
    kv.clear_all().unwrap();
    assert_eq!(kv.count().unwrap(), 0);
    assert_eq!(kv.actual_size().unwrap(), 0);
}

#[test]
fn explicit_root() {
    let root = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let kv = ctx
        .open(StoreId::with_root("elsewhere", other.path()), ProcessMode::Single, None)
        .unwrap();
    kv.set_bool("here", true).unwrap();
    kv.sync().unwrap();

    assert!(other.path().join("elsewhere").exists());
    assert!(other.path().join("elsewhere.crc").exists());
    assert!(!root.path().join("elsewhere").exists());
}

#[test]
fn close_invalidates_copies() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let kv = ctx.open("closing", ProcessMode::Single, None).unwrap();
    let copy = kv.clone();
    let handle = kv.handle();
    kv.set_bool("kept", true).unwrap();
    kv.close();

    assert!(copy.is_closed());
    assert!(matches!(copy.get_bool("kept"), Err(Error::Closed(_))));
    assert_eq!(ctx.open_count(), 0);

    let reopened = ctx.open("closing", ProcessMode::Single, None).unwrap();
    assert_ne!(reopened.handle(), handle);
    assert_eq!(reopened.get_bool("kept").unwrap(), Some(true));
}

#[test]
fn envelope_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = owner
        .obtain_ashmem("exported", 4096, ProcessMode::Multi, None)
        .unwrap();
    assert!(kv.is_anonymous());
    kv.set_str("before", "export").unwrap();

    let adopted = peer.adopt(kv.export_envelope().unwrap()).unwrap();
    assert_eq!(adopted.get_str("before").unwrap().as_deref(), Some("export"));

    adopted.set_str("after", "import").unwrap();
    assert_eq!(kv.get_str("after").unwrap().as_deref(), Some("import"));
    assert_eq!(kv.total_size().unwrap(), 4096usize.max(owner.page_size()));
}

#[test]
fn adopting_twice_keeps_the_handle() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = owner
        .obtain_ashmem("twice", 4096, ProcessMode::Multi, Some("key"))
        .unwrap();
    kv.set_bool("x", true).unwrap();

    let first = peer.adopt(kv.export_envelope().unwrap()).unwrap();
    let second = peer.adopt(kv.export_envelope().unwrap()).unwrap();
    assert_eq!(first.handle(), second.handle());
    assert_eq!(peer.open_count(), 1);
    assert_eq!(second.crypt_key().unwrap().as_deref(), Some("key"));
    assert_eq!(second.get_bool("x").unwrap(), Some(true));
}

#[test]
fn anonymous_store_does_not_grow() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");

    let kv = owner
        .obtain_ashmem("small", 1, ProcessMode::Multi, None)
        .unwrap();
    let page = owner.page_size();
    assert_eq!(kv.total_size().unwrap(), page);

    let err = kv.set_bytes("huge", &vec![0; page]).unwrap_err();
    assert!(matches!(err, Error::FixedSizeExceeded { .. }), "{err}");
    kv.set_bytes("small", &[1; 16]).unwrap();
}

#[test]
fn broker_hands_out_the_owners_store() {
    let root = tempfile::tempdir().unwrap();
    let socket = root.path().join("app.broker");

    let owner = context(root.path(), "app");
    let shared = owner
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap();
    shared.set_bool("bool", true).unwrap();

    let server = BrokerServer::bind(Arc::clone(&owner), &socket).unwrap();
    let serving = std::thread::spawn(move || server.serve_one());

    let mut config = Config::new(root.path());
    config.process_name = Some("app:remote".into());
    config.broker_endpoint = Some(socket.clone());
    config.process_mode_checker = true;
    let remote = Context::initialize(config);
    assert!(!remote.is_owner().unwrap());

    let kv = remote
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap();
    serving.join().unwrap().unwrap();

    assert_eq!(kv.get_bool("bool").unwrap(), Some(true));
    kv.set_i32("from-remote", 7).unwrap();
    assert_eq!(shared.get_i32("from-remote").unwrap(), Some(7));

    // Held now, no second request.
    let again = remote
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap();
    assert_eq!(again.handle(), kv.handle());
}

#[test]
fn broker_creates_missing_stores() {
    let root = tempfile::tempdir().unwrap();
    let socket = root.path().join("create.broker");

    let owner = context(root.path(), "app");
    let server = BrokerServer::bind(Arc::clone(&owner), &socket).unwrap();
    let serving = std::thread::spawn(move || server.serve_one());

    let mut config = Config::new(root.path());
    config.process_name = Some("app:remote".into());
    config.broker_endpoint = Some(socket);
    let remote = Context::initialize(config);

    let kv = remote
        .obtain_ashmem("fresh", 8192, ProcessMode::Multi, Some("secret"))
        .unwrap();
    serving.join().unwrap().unwrap();

    assert_eq!(kv.total_size().unwrap(), 8192usize.max(owner.page_size()));
    assert_eq!(kv.crypt_key().unwrap().as_deref(), Some("secret"));
    assert_eq!(owner.open_count(), 1);
}

#[test]
fn keyless_request_keeps_the_owners_key() {
    let root = tempfile::tempdir().unwrap();
    let socket = root.path().join("enc.broker");

    let owner = context(root.path(), "app");
    let held = owner
        .obtain_ashmem("enc", 4096, ProcessMode::Multi, Some("secret"))
        .unwrap();
    held.set_str("k", "v").unwrap();

    let server = BrokerServer::bind(Arc::clone(&owner), &socket).unwrap();
    let serving = std::thread::spawn(move || server.serve_one());

    let mut config = Config::new(root.path());
    config.process_name = Some("app:remote".into());
    config.broker_endpoint = Some(socket);
    let remote = Context::initialize(config);

    let kv = remote
        .obtain_ashmem("enc", 4096, ProcessMode::Multi, None)
        .unwrap();
    serving.join().unwrap().unwrap();

    assert_eq!(held.crypt_key().unwrap().as_deref(), Some("secret"));
    assert_eq!(held.get_str("k").unwrap().as_deref(), Some("v"));
    // The answer carries the key the store is held with.
    assert_eq!(kv.crypt_key().unwrap().as_deref(), Some("secret"));
    assert_eq!(kv.get_str("k").unwrap().as_deref(), Some("v"));
}

#[test]
fn reopen_keeps_the_key() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let first = ctx
        .open("keyed", ProcessMode::Single, Some("secret"))
        .unwrap();
    first.set_str("k", "v").unwrap();

    let second = ctx.open("keyed", ProcessMode::Single, None).unwrap();
    assert_eq!(second.handle(), first.handle());
    assert_eq!(first.crypt_key().unwrap().as_deref(), Some("secret"));
    assert_eq!(first.get_str("k").unwrap().as_deref(), Some("v"));
}

#[test]
fn broker_reports_mode_mismatch() {
    let root = tempfile::tempdir().unwrap();
    let socket = root.path().join("mismatch.broker");

    let owner = context(root.path(), "app");
    owner
        .obtain_ashmem("single", 4096, ProcessMode::Single, None)
        .unwrap();
    let server = BrokerServer::bind(Arc::clone(&owner), &socket).unwrap();
    let serving = std::thread::spawn(move || server.serve_one());

    let mut config = Config::new(root.path());
    config.process_name = Some("app:remote".into());
    config.broker_endpoint = Some(socket);
    let remote = Context::initialize(config);

    let err = remote
        .obtain_ashmem("single", 4096, ProcessMode::Multi, None)
        .unwrap_err();
    serving.join().unwrap().unwrap();

    match err {
        Error::Rejected { id, message } => {
            assert_eq!(id, "single");
            assert!(message.contains("single-process"), "{message}");
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(remote.open_count(), 0);
}

#[test]
fn unreachable_broker() {
    let root = tempfile::tempdir().unwrap();

    // Neither configured nor registered.
    let remote = context(root.path(), "app:remote");
    let err = remote
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap_err();
    assert!(matches!(err, Error::BrokerUnreachable { .. }), "{err}");
    assert!(!err.is_retryable());

    // Configured but nobody listening.
    let mut config = Config::new(root.path());
    config.process_name = Some("app:remote".into());
    config.broker_endpoint = Some(root.path().join("nobody.broker"));
    let remote = Context::initialize(config);
    let err = remote
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap_err();
    assert!(matches!(err, Error::BrokerUnreachable { .. }), "{err}");
}

#[test]
fn unknown_process_name() {
    struct Nothing;

    impl NameStrategy for Nothing {
        fn name(&self) -> Option<String> {
            None
        }
    }

    let root = tempfile::tempdir().unwrap();
    let identity = ProcessIdentifier::new(vec![Box::new(Nothing)], OwnerRule::MainProcess);
    let ctx = Context::with_identity(Config::new(root.path()), identity);

    let err = ctx
        .obtain_ashmem("shared", 4096, ProcessMode::Multi, None)
        .unwrap_err();
    assert!(matches!(err, Error::ProcessNameUnavailable));
    assert!(err.is_retryable());

    // File-backed stores do not depend on the name.
    ctx.open("plain", ProcessMode::Single, None).unwrap();
}

#[test]
fn named_owner() {
    let root = tempfile::tempdir().unwrap();
    let identity = ProcessIdentifier::new(
        vec![Box::new(Fixed("launcher".into()))],
        OwnerRule::Named("launcher".into()),
    );
    let ctx = Context::with_identity(Config::new(root.path()), identity);

    assert!(ctx.is_owner().unwrap());
    assert!(ctx
        .obtain_ashmem("mine", 4096, ProcessMode::Multi, None)
        .unwrap()
        .is_anonymous());
}

#[test]
fn rekey_reaches_peers_only_when_reset() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = owner
        .obtain_ashmem("crypt", 4096, ProcessMode::Multi, Some("old"))
        .unwrap();
    kv.set_str("secret", "value").unwrap();
    let other = peer.adopt(kv.export_envelope().unwrap()).unwrap();
    assert_eq!(other.get_str("secret").unwrap().as_deref(), Some("value"));

    let pending = kv.rotate_key("new").unwrap();
    assert_eq!(pending.new_key(), "new");
    assert_eq!(kv.crypt_key().unwrap().as_deref(), Some("new"));
    assert_eq!(kv.get_str("secret").unwrap().as_deref(), Some("value"));

    // Still on the old key.
    assert_eq!(other.get_str("secret").unwrap(), None);

    assert!(pending.apply(&other).unwrap());
    assert_eq!(other.crypt_key().unwrap().as_deref(), Some("new"));
    assert_eq!(other.get_str("secret").unwrap().as_deref(), Some("value"));

    // Writes under the new key are readable by both.
    other.set_str("reply", "ok").unwrap();
    assert_eq!(kv.get_str("reply").unwrap().as_deref(), Some("ok"));
}

#[test]
fn later_rotation_supersedes() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = owner
        .obtain_ashmem("rotating", 4096, ProcessMode::Multi, Some("one"))
        .unwrap();
    kv.set_i32("n", 1).unwrap();
    let other = peer.adopt(kv.export_envelope().unwrap()).unwrap();

    let stale = kv.rotate_key("two").unwrap();
    let latest = kv.rotate_key("").unwrap();
    assert!(latest.epoch() > stale.epoch());

    assert!(!stale.apply(&other).unwrap());
    assert!(latest.apply(&other).unwrap());
    assert_eq!(other.crypt_key().unwrap(), None);
    assert_eq!(other.get_i32("n").unwrap(), Some(1));
}

#[test]
fn changes_by_others_are_reported_inline() {
    let root = tempfile::tempdir().unwrap();
    let owner = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = owner
        .obtain_ashmem("watched", 4096, ProcessMode::Multi, None)
        .unwrap();
    let other = peer.adopt(kv.export_envelope().unwrap()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    peer.register_content_change_listener(move |id| sink.lock().unwrap().push(id.clone()));

    // Own writes are not reported.
    other.set_i32("own", 1).unwrap();
    assert_eq!(other.get_i32("own").unwrap(), Some(1));
    assert!(seen.lock().unwrap().is_empty());

    kv.set_i32("theirs", 2).unwrap();
    assert!(seen.lock().unwrap().is_empty(), "nothing without a call");
    assert_eq!(other.get_i32("theirs").unwrap(), Some(2));
    assert_eq!(seen.lock().unwrap().as_slice(), [StoreId::new("watched")]);

    // Observed once.
    assert_eq!(other.get_i32("theirs").unwrap(), Some(2));
    assert_eq!(seen.lock().unwrap().len(), 1);

    kv.remove("theirs").unwrap();
    assert!(other.check_content_changed().unwrap());
    assert!(!other.check_content_changed().unwrap());
    assert_eq!(seen.lock().unwrap().len(), 2);

    peer.unregister_content_change_listener();
    kv.set_i32("quiet", 3).unwrap();
    assert!(other.check_content_changed().unwrap());
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn full_rewrite_is_reloaded_by_peers() {
    let root = tempfile::tempdir().unwrap();
    let a = context(root.path(), "app");
    let b = context(root.path(), "app:b");

    let kv = a.open("rewrite", ProcessMode::Multi, None).unwrap();
    let other = b.open("rewrite", ProcessMode::Multi, None).unwrap();

    let value = vec![3u8; 600];
    for i in 0..32 {
        kv.set_bytes(&format!("k{i}"), &value).unwrap();
    }
    kv.trim().unwrap();

    assert_eq!(other.count().unwrap(), 32);
    assert_eq!(other.get_bytes("k31").unwrap(), Some(value));
    assert_eq!(other.total_size().unwrap(), kv.total_size().unwrap());
}

#[test]
fn try_lock_sees_other_threads() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let kv = ctx.open("threads", ProcessMode::Multi, None).unwrap();

    kv.lock().unwrap();
    let other = kv.clone();
    let blocked = std::thread::spawn(move || other.try_lock().unwrap())
        .join()
        .unwrap();
    assert!(!blocked);

    // Recursive for the holding thread.
    assert!(kv.try_lock().unwrap());
    kv.unlock().unwrap();
    kv.unlock().unwrap();

    let other = kv.clone();
    let free = std::thread::spawn(move || {
        let locked = other.try_lock().unwrap();
        other.unlock().unwrap();
        locked
    })
    .join()
    .unwrap();
    assert!(free);
}

#[test]
fn lock_waits_for_release() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let kv = ctx.open("waiting", ProcessMode::Single, None).unwrap();

    kv.lock().unwrap();
    let other = kv.clone();
    let waiter = std::thread::spawn(move || {
        other.lock().unwrap();
        let value = other.get_i32("written").unwrap();
        other.unlock().unwrap();
        value
    });

    std::thread::sleep(std::time::Duration::from_millis(50));
    kv.set_i32("written", 5).unwrap();
    kv.unlock().unwrap();

    assert_eq!(waiter.join().unwrap(), Some(5));
}

#[test]
fn value_sizes() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let plain = ctx.open("plain-sizes", ProcessMode::Single, None).unwrap();
    let keyed = ctx
        .open("keyed-sizes", ProcessMode::Single, Some("secret"))
        .unwrap();

    for kv in [&plain, &keyed] {
        kv.set_str("greeting", "hello").unwrap();
        assert_eq!(kv.value_size("greeting").unwrap(), 5);
        assert_eq!(kv.value_size("absent").unwrap(), 0);
        assert_eq!(kv.stored_size("absent").unwrap(), 0);
    }

    // Two length prefixes, the key and the value.
    assert_eq!(plain.stored_size("greeting").unwrap(), 8 + 8 + 5);
    assert!(keyed.stored_size("greeting").unwrap() > 8 + 8 + 5);
}

#[test]
fn cleared_cache_reads_back() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let kv = ctx.open("cached", ProcessMode::Multi, None).unwrap();
    kv.set_i64("k", 7).unwrap();

    kv.clear_memory_cache().unwrap();
    assert_eq!(kv.get_i64("k").unwrap(), Some(7));
    assert_eq!(kv.keys().unwrap(), ["k"]);
    assert!(!kv.check_content_changed().unwrap());
}

#[test]
fn restore_reaches_every_holder() {
    let root = tempfile::tempdir().unwrap();
    let backup = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let peer = context(root.path(), "app:peer");

    let kv = ctx.open("notes", ProcessMode::Multi, None).unwrap();
    kv.set_str("note", "first").unwrap();
    ctx.backup_one_to_directory("notes", backup.path()).unwrap();

    let other = peer.open("notes", ProcessMode::Multi, None).unwrap();
    other.set_str("note", "second").unwrap();
    other.set_bool("extra", true).unwrap();

    ctx.restore_one_from_directory("notes", backup.path()).unwrap();
    assert_eq!(kv.get_str("note").unwrap().as_deref(), Some("first"));
    assert_eq!(other.get_str("note").unwrap().as_deref(), Some("first"));
    assert!(!other.contains("extra").unwrap());
}

#[test]
fn backup_all_and_restore_elsewhere() {
    let root = tempfile::tempdir().unwrap();
    let backup = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");

    let held = ctx.open("held", ProcessMode::Single, None).unwrap();
    held.set_i32("n", 1).unwrap();
    let closed = ctx.open("closed", ProcessMode::Single, None).unwrap();
    closed.set_i32("n", 2).unwrap();
    closed.close();

    assert!(ctx.is_file_valid("held"));
    assert!(ctx.is_file_valid("closed"));
    assert!(!ctx.is_file_valid("missing"));
    assert!(matches!(
        ctx.backup_one_to_directory("missing", backup.path()),
        Err(Error::Io(_))
    ));

    assert_eq!(ctx.backup_all_to_directory(backup.path()).unwrap(), 2);
    // Backing up must not have opened the closed store for good.
    assert_eq!(ctx.open_count(), 1);

    let elsewhere = tempfile::tempdir().unwrap();
    let fresh = context(elsewhere.path(), "app");
    assert_eq!(fresh.restore_all_from_directory(backup.path()).unwrap(), 2);
    assert_eq!(fresh.open_count(), 0);
    assert!(fresh.is_file_valid("held"));

    let restored = fresh.open("closed", ProcessMode::Single, None).unwrap();
    assert_eq!(restored.get_i32("n").unwrap(), Some(2));
    let restored = fresh.open("held", ProcessMode::Single, None).unwrap();
    assert_eq!(restored.get_i32("n").unwrap(), Some(1));
}

#[test]
fn corrupt_files_are_not_valid() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(root.path(), "app");
    let kv = ctx.open("fragile", ProcessMode::Single, None).unwrap();
    kv.set_str("k", "value").unwrap();
    kv.sync().unwrap();
    kv.close();
    assert!(ctx.is_file_valid("fragile"));

    let meta = root.path().join("fragile.crc");
    let mut bytes = std::fs::read(&meta).unwrap();
    bytes[..4].copy_from_slice(b"nope");
    std::fs::write(&meta, bytes).unwrap();
    assert!(!ctx.is_file_valid("fragile"));
}

use agent_bridge::session::{thread_key, SessionDescriptor, SessionStore};

fn descriptor(channel: &str, thread: &str, session: &str) -> SessionDescriptor {
    SessionDescriptor::new(channel, thread, "demo", "/agents/demo", session, "U1")
}

#[test]
fn thread_key_joins_channel_and_thread() {
    assert_eq!(thread_key("C1", "123.456"), "C1:123.456");
}

#[test]
fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::load(dir.path().join("sessions.json")).expect("load");
    assert_eq!(store.count(), 0);
    assert!(store.get("C1", "T1").is_none());
}

#[test]
fn set_then_get_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::load(dir.path().join("sessions.json")).expect("load");

    store.set(descriptor("C1", "T1", "s1"));
    let fetched = store.get("C1", "T1").expect("descriptor");
    assert_eq!(fetched.session_id, "s1");
    assert_eq!(fetched.task_name, "demo");
    assert_eq!(fetched.user_id, "U1");
}

#[test]
fn set_stamps_updated_at() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::load(dir.path().join("sessions.json")).expect("load");

    let mut original = descriptor("C1", "T1", "s1");
    original.updated_at = original.created_at - chrono::Duration::hours(1);
    store.set(original.clone());

    let fetched = store.get("C1", "T1").expect("descriptor");
    assert!(fetched.updated_at > original.updated_at);
}

#[test]
fn save_then_load_is_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::load(&path).expect("load");
    store.set(descriptor("C1", "T1", "s1"));
    store.set(descriptor("C2", "T2", "s2"));
    store.save().expect("save");

    let reloaded = SessionStore::load(&path).expect("reload");
    assert_eq!(reloaded.count(), 2);
    assert_eq!(
        reloaded.get("C1", "T1").map(|d| d.session_id),
        store.get("C1", "T1").map(|d| d.session_id)
    );
    assert_eq!(
        reloaded.get("C2", "T2").map(|d| d.session_id),
        store.get("C2", "T2").map(|d| d.session_id)
    );
}

#[test]
fn saved_file_is_a_valid_json_array() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::load(&path).expect("load");
    store.set(descriptor("C1", "T1", "s1"));
    store.save().expect("save");

    let raw = std::fs::read(&path).expect("read saved file");
    let parsed: serde_json::Value = serde_json::from_slice(&raw).expect("valid json");
    assert!(parsed.is_array());
    assert_eq!(parsed.as_array().map(Vec::len), Some(1));
}

#[test]
fn save_leaves_no_temp_files_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");

    let store = SessionStore::load(&path).expect("load");
    store.set(descriptor("C1", "T1", "s1"));
    store.save().expect("save");
    store.save().expect("second save");

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["sessions.json".to_owned()]);
}

#[test]
fn set_replaces_the_descriptor_for_a_thread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::load(dir.path().join("sessions.json")).expect("load");

    store.set(descriptor("C1", "T1", "s1"));
    store.set(descriptor("C1", "T1", "s2"));

    assert_eq!(store.count(), 1);
    assert_eq!(store.get("C1", "T1").map(|d| d.session_id), Some("s2".to_owned()));
}

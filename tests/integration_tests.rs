#![cfg(target_os = "linux")]

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use treewatch::{
    EventMask, Registry, SemanticEvent, TreewatchConfig, WatchEvent, WatchHandle, WatchState,
};

fn open_registry() -> Registry {
    Registry::open(TreewatchConfig::default()).expect("Failed to open inotify")
}

fn listen(handle: &WatchHandle) -> Receiver<WatchEvent> {
    let (tx, rx) = mpsc::channel();
    handle.set_listener(move |event: &WatchEvent| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

/// Receive until `matches` accepts an event, returning everything seen on the way.
fn wait_for<F>(rx: &Receiver<WatchEvent>, matches: F) -> Vec<WatchEvent>
where
    F: Fn(&WatchEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) => {
                let done = matches(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(_) => break,
        }
    }
    panic!("expected event never arrived; saw {:?}", seen);
}

fn is(kind: SemanticEvent, path: &str) -> impl Fn(&WatchEvent) -> bool {
    let path = PathBuf::from(path);
    move |event| event.kind == kind && event.path == path
}

#[test]
fn test_file_creation_in_subdirectory() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir_all(temp_dir.path().join("src/nested")).unwrap();
    let registry = open_registry();
    let handle = registry.watch(temp_dir.path(), true, EventMask::CREATE);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");
    assert_eq!(handle.owned_handles().len(), 3);

    fs::write(temp_dir.path().join("src/nested/lib.rs"), "fn main() {}").unwrap();

    let seen = wait_for(&rx, is(SemanticEvent::Created, "src/nested/lib.rs"));
    assert_eq!(seen.len(), 1);
}

#[test]
fn test_create_rename_scenario() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let registry = open_registry();
    let handle = registry.watch(root, true, EventMask::CREATE | EventMask::MOVE);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");

    fs::create_dir(root.join("a")).unwrap();
    let seen = wait_for(&rx, is(SemanticEvent::Created, "a"));
    assert!(seen[0].is_dir);

    fs::write(root.join("a/b.txt"), "hello").unwrap();
    wait_for(&rx, is(SemanticEvent::Created, "a/b.txt"));

    fs::rename(root.join("a/b.txt"), root.join("a/c.txt")).unwrap();
    let seen = wait_for(&rx, |e| matches!(e.kind, SemanticEvent::Renamed { .. }));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].renamed_from(), Some(&PathBuf::from("a/b.txt")));
    assert_eq!(seen[0].path, PathBuf::from("a/c.txt"));
}

#[test]
fn test_renamed_directory_keeps_reporting_under_new_name() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    fs::create_dir_all(root.join("old/inner")).unwrap();
    let registry = open_registry();
    let handle = registry.watch(root, true, EventMask::CREATE | EventMask::MOVE);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");

    fs::rename(root.join("old"), root.join("new")).unwrap();
    wait_for(&rx, |e| matches!(e.kind, SemanticEvent::Renamed { .. }));

    fs::write(root.join("new/inner/file.txt"), "x").unwrap();
    wait_for(&rx, is(SemanticEvent::Created, "new/inner/file.txt"));
}

#[test]
fn test_file_moved_out_is_deleted() {
    let watched = TempDir::new().expect("Failed to create temp dir");
    let outside = TempDir::new().expect("Failed to create temp dir");
    fs::write(watched.path().join("leaving.txt"), "bye").unwrap();
    let registry = open_registry();
    let handle = registry.watch(watched.path(), true, EventMask::MOVE);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");

    fs::rename(
        watched.path().join("leaving.txt"),
        outside.path().join("leaving.txt"),
    )
    .unwrap();

    wait_for(&rx, is(SemanticEvent::Deleted, "leaving.txt"));
}

#[test]
fn test_stop_releases_all_watches() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir_all(temp_dir.path().join("a/b/c")).unwrap();
    let registry = open_registry();
    let handle = registry.watch(temp_dir.path(), true, EventMask::ALL_EVENTS);

    handle.start().wait().expect("start failed");
    assert_eq!(registry.handle_count(), 4);

    handle.stop().wait().expect("stop failed");
    assert_eq!(handle.state(), WatchState::Idle);
    assert!(handle.owned_handles().is_empty());
    assert_eq!(registry.handle_count(), 0);

    handle.start().wait().expect("restart failed");
    assert_eq!(handle.owned_handles().len(), 4);
}

#[test]
fn test_deleting_root_ends_the_watch() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().join("root");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("sub/file.txt"), "x").unwrap();
    let registry = open_registry();
    let handle = registry.watch(&root, true, EventMask::ALL_EVENTS);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");

    fs::remove_dir_all(&root).unwrap();

    let seen = wait_for(&rx, |e| e.kind == SemanticEvent::SelfDeleted);
    assert_eq!(
        seen.iter().filter(|e| e.kind == SemanticEvent::SelfDeleted).count(),
        1
    );
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.state() != WatchState::Idle && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(handle.state(), WatchState::Idle);
    assert_eq!(registry.handle_count(), 0);
}

#[test]
fn test_global_registry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let handle = WatchHandle::new(temp_dir.path(), false, EventMask::CREATE);
    let rx = listen(&handle);
    handle.start().wait().expect("start failed");

    fs::write(temp_dir.path().join("hello.txt"), "hi").unwrap();

    wait_for(&rx, is(SemanticEvent::Created, "hello.txt"));
    assert!(Registry::global().is_ok());
}

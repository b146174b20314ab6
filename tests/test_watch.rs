mod common;

use std::time::Duration;

use branchstore::*;
use common::PROJECT;

fn watch_prefix(prefix: &str) -> WatchOptions {
    WatchOptions {
        path_filters: vec![prefix.to_string()],
        ..Default::default()
    }
}

fn paths(events: &[WatchEvent]) -> Vec<&str> {
    events.iter().map(|e| e.path.as_str()).collect()
}

#[tokio::test]
async fn live_events_respect_prefix() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let mut w = main.watch(watch_prefix("/a/")).await.unwrap();

    main.write_file("/a/b.txt", "1", None).await.unwrap();
    main.write_file("/z/c.txt", "2", None).await.unwrap();

    let events = w.drain();
    assert_eq!(paths(&events), vec!["/a/b.txt"]);
    assert_eq!(events[0].kind, WatchEventType::Added);
    assert_eq!(events[0].patch_id, 1);
}

#[tokio::test]
async fn replay_respects_prefix() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.write_file("/a/b.txt", "1", None).await.unwrap();
    main.write_file("/z/c.txt", "2", None).await.unwrap();

    let mut w = main
        .watch(WatchOptions {
            from_ctime: Some(0),
            ..watch_prefix("/a/")
        })
        .await
        .unwrap();
    assert_eq!(paths(&w.drain()), vec!["/a/b.txt"]);
}

#[tokio::test]
async fn event_kinds_follow_the_tree() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let mut w = main.watch(WatchOptions::default()).await.unwrap();

    main.write_file("/f", "1", None).await.unwrap();
    main.write_file("/f", "2", None).await.unwrap();
    main.delete_file("/f").await.unwrap();
    main.delete_file("/f").await.unwrap();

    let kinds: Vec<_> = w.drain().into_iter().map(|e| (e.kind, e.patch_id)).collect();
    assert_eq!(
        kinds,
        vec![
            (WatchEventType::Added, 1),
            (WatchEventType::Modified, 2),
            (WatchEventType::Deleted, 3),
        ]
    );
}

#[tokio::test]
async fn replay_only_covers_newer_patches_then_goes_live() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let t1 = main.write_file("/a/1", "x", None).await.unwrap().ctime;
    main.write_file("/a/2", "x", None).await.unwrap();

    let mut w = main
        .watch(WatchOptions {
            from_ctime: Some(t1),
            ..Default::default()
        })
        .await
        .unwrap();
    main.write_file("/a/3", "x", None).await.unwrap();

    let first = w.next().await.unwrap();
    assert_eq!(first.path, "/a/2");
    let second = tokio::time::timeout(Duration::from_secs(5), w.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.path, "/a/3");
    assert!(w.try_next().is_none());
}

#[tokio::test]
async fn replay_reports_first_change_per_path() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.write_file("/cfg", "1", None).await.unwrap();
    main.write_file("/cfg", "2", None).await.unwrap();
    main.write_file("/cfg", "3", None).await.unwrap();

    let mut w = main
        .watch(WatchOptions {
            from_ctime: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    let events = w.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, WatchEventType::Added);
    assert_eq!(events[0].patch_id, 1);
}

#[tokio::test]
async fn subscriptions_widen_and_narrow_a_watcher() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let mut w = main
        .watch(WatchOptions {
            watcher_id: Some("w1".into()),
            ..watch_prefix("/a/")
        })
        .await
        .unwrap();
    assert_eq!(w.id(), "w1");

    let sub = main
        .subscribe("w1", Some(vec!["/b/".into()]), None)
        .unwrap()
        .unwrap();
    main.write_file("/b/1", "x", None).await.unwrap();
    main.write_file("/c/1", "x", None).await.unwrap();
    assert_eq!(paths(&w.drain()), vec!["/b/1"]);

    main.unsubscribe(&sub).unwrap();
    main.write_file("/b/2", "x", None).await.unwrap();
    main.write_file("/a/2", "x", None).await.unwrap();
    assert_eq!(paths(&w.drain()), vec!["/a/2"]);

    let err = main.unsubscribe(&sub).unwrap_err();
    assert!(matches!(err, Error::UnknownSubscription(_)));
}

#[tokio::test]
async fn duplicate_watcher_id_is_rejected() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let opts = WatchOptions {
        watcher_id: Some("dup".into()),
        ..Default::default()
    };
    let _w = main.watch(opts.clone()).await.unwrap();
    let err = main.watch(opts).await.unwrap_err();
    assert!(matches!(err, Error::WatcherExists(_)));
}

#[tokio::test]
async fn dropping_the_stream_tears_down() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let w = main
        .watch(WatchOptions {
            watcher_id: Some("gone".into()),
            ..watch_prefix("/a/")
        })
        .await
        .unwrap();
    main.subscribe("gone", Some(vec!["/b/".into()]), Some("extra".into()))
        .unwrap();
    assert_eq!(main.watcher_count(), 1);

    drop(w);
    assert_eq!(main.watcher_count(), 0);
    assert!(matches!(main.unsubscribe("extra"), Err(Error::UnknownSubscription(_))));
    assert!(matches!(
        main.subscribe("gone", Some(vec![]), None),
        Err(Error::UnknownWatcher(_))
    ));
    // writes after teardown must not fail
    main.write_file("/a/x", "x", None).await.unwrap();
}

#[tokio::test]
async fn merge_and_soft_delete_notify_once_per_path() {
    let store = common::memory_store();
    let main = common::main_with_files(&store).await;
    let feature = main.branch("feature").await.unwrap();
    feature.write_file("/dir/c.txt", "c", None).await.unwrap();

    let mut w = main.watch(WatchOptions::default()).await.unwrap();
    main.merge(Some("feature"), MergeStrategy::Override).await.unwrap();
    let merged = w.drain();
    assert_eq!(paths(&merged), vec!["/dir/c.txt"]);

    main.soft_delete().await.unwrap();
    let deleted = w.drain();
    assert_eq!(deleted.len(), 4);
    assert!(deleted.iter().all(|e| e.kind == WatchEventType::Deleted));
    assert!(deleted.iter().all(|e| e.patch_id == deleted[0].patch_id));
}

#[tokio::test]
async fn events_serialize_with_wire_names() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    let mut w = main.watch(WatchOptions::default()).await.unwrap();
    main.write_file("/a", "x", None).await.unwrap();

    let event = w.drain().pop().unwrap();
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "added");
    assert_eq!(json["path"], "/a");
    assert_eq!(json["patchId"], 1);
    assert!(json["metadata"]["sizeInBytes"].is_number());
}

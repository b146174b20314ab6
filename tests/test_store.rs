mod common;

use branchstore::*;
use common::{read_text, PROJECT};

#[tokio::test]
async fn branch_creates_on_first_use() {
    let store = common::memory_store();
    assert!(store.get_branch(PROJECT, "main").await.unwrap().is_none());
    let main = store.branch(PROJECT, "main").await.unwrap();
    assert_eq!(main.name(), "main");
    assert_eq!(main.project_id(), PROJECT);
    assert_eq!(main.seq().await.unwrap(), 0);
    assert!(main.get_origin().await.unwrap().is_none());
    assert!(store.get_branch(PROJECT, "main").await.unwrap().is_some());
    assert_eq!(store.open_branches(PROJECT), vec!["main"]);
}

#[tokio::test]
async fn create_branch_with_initial_tree() {
    let store = common::memory_store();
    let main = common::main_with_files(&store).await;
    let tree = (*main.tree().await.unwrap()).clone();

    let copy = store
        .create_branch(PROJECT, BranchConfig::new("copy").with_tree(tree.clone()))
        .await
        .unwrap();
    assert_eq!(copy.seq().await.unwrap(), 1);
    assert_eq!(*copy.tree().await.unwrap(), tree);
    assert!(copy.get_origin().await.unwrap().is_none());

    let err = store
        .create_branch(PROJECT, BranchConfig::new("copy"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BranchExists(_)));
}

#[tokio::test]
async fn handles_share_one_branch() {
    let store = common::memory_store();
    let a = store.branch(PROJECT, "main").await.unwrap();
    let b = store.branch(PROJECT, "main").await.unwrap();
    a.write_file("/x", "1", None).await.unwrap();
    assert_eq!(read_text(&b, "/x").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn branches_and_projects_are_isolated() {
    let store = common::memory_store();
    let main = store.branch("acme", "main").await.unwrap();
    let other = store.branch("acme", "other").await.unwrap();
    let foreign = store.branch("globex", "main").await.unwrap();

    main.write_file("/only-main", "m", None).await.unwrap();
    assert!(!other.has_file("/only-main").await.unwrap());
    assert!(!foreign.has_file("/only-main").await.unwrap());
    assert!(other.list_files(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let store = common::memory_store();
    for bad in ["", "a/b", "..x", ".hidden", "-flag", "x.lock", "sp ace"] {
        let err = store.branch(PROJECT, bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBranchName(_)), "{bad:?}: {err}");
    }
    let err = store.branch("bad/project", "main").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn missing_root_without_create_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = Store::open(OpenOptions {
        root: Some(dir.path().join("nope")),
        create: false,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (tree, history) = {
        let store = common::disk_store(dir.path());
        let main = common::main_with_files(&store).await;
        let feature = main.branch("feature").await.unwrap();
        feature.write_file("/feature.txt", "f", None).await.unwrap();
        main.delete_file("/dir/b.txt").await.unwrap();
        (
            main.tree().await.unwrap(),
            main.history(None).await.unwrap(),
        )
    };

    let store = common::disk_store(dir.path());
    let main = store.get_branch(PROJECT, "main").await.unwrap().unwrap();
    assert_eq!(main.tree().await.unwrap(), tree);
    assert_eq!(main.history(None).await.unwrap(), history);
    assert_eq!(main.seq().await.unwrap(), history.len() as u64);
    assert_eq!(read_text(&main, "/dir/a.txt").await.as_deref(), Some("aaa"));

    let feature = store.get_branch(PROJECT, "feature").await.unwrap().unwrap();
    assert_eq!(feature.get_origin().await.unwrap().as_deref(), Some("main"));
    assert_eq!(read_text(&feature, "/feature.txt").await.as_deref(), Some("f"));

    // writes continue the same log
    let meta = main.write_file("/after.txt", "later", None).await.unwrap();
    let last = main.history(None).await.unwrap().pop().unwrap();
    assert_eq!(last.id, history.len() as u64 + 1);
    assert!(meta.ctime > history.last().unwrap().timestamp);
}

#[tokio::test]
async fn disk_layout_is_per_project() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::disk_store(dir.path());
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.write_file("/a", "x", None).await.unwrap();

    let root = store.root().unwrap();
    assert!(root.join(PROJECT).join("blobs").is_dir());
    let branch_dir = root.join(PROJECT).join("branches").join("main");
    assert!(branch_dir.join("state.json").is_file());
    assert!(branch_dir.join("patches.jsonl").is_file());
}

#[tokio::test]
async fn origin_change_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = common::disk_store(dir.path());
        let main = store.branch(PROJECT, "main").await.unwrap();
        main.set_origin(Some("upstream".into())).await.unwrap();
    }
    let store = common::disk_store(dir.path());
    let main = store.branch(PROJECT, "main").await.unwrap();
    assert_eq!(main.get_origin().await.unwrap().as_deref(), Some("upstream"));
}

#[tokio::test]
async fn closed_branch_reloads_from_storage() {
    let store = common::memory_store();
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.write_file("/a", "1", None).await.unwrap();
    drop(main);

    assert!(store.close_branch(PROJECT, "main"));
    assert!(!store.close_branch(PROJECT, "main"));
    assert!(store.open_branches(PROJECT).is_empty());

    let main = store.get_branch(PROJECT, "main").await.unwrap().unwrap();
    assert_eq!(read_text(&main, "/a").await.as_deref(), Some("1"));
    assert_eq!(main.seq().await.unwrap(), 1);
}

fn branch_dir(store: &Store, name: &str) -> std::path::PathBuf {
    store.root().unwrap().join(PROJECT).join("branches").join(name)
}

#[tokio::test]
async fn failed_disk_commit_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::disk_store(dir.path());
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.write_file("/one", "1", None).await.unwrap();

    // The state row is written through this temp path; a directory there
    // makes that step fail after the patch line is appended.
    let blocker = branch_dir(&store, "main").join(".state.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(main.write_file("/two", "2", None).await.is_err());
    assert!(!main.has_file("/two").await.unwrap());
    assert_eq!(main.history(None).await.unwrap().len(), 1);

    std::fs::remove_dir(&blocker).unwrap();
    main.write_file("/three", "3", None).await.unwrap();
    assert_eq!(main.seq().await.unwrap(), 2);

    drop(main);
    assert!(store.close_branch(PROJECT, "main"));
    let main = store.get_branch(PROJECT, "main").await.unwrap().unwrap();
    assert!(!main.has_file("/two").await.unwrap());
    assert!(main.has_file("/three").await.unwrap());
    let ids: Vec<_> = main.history(None).await.unwrap().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn torn_log_tail_is_dropped_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = common::disk_store(dir.path());
        let main = store.branch(PROJECT, "main").await.unwrap();
        main.write_file("/one", "1", None).await.unwrap();
        let log = branch_dir(&store, "main").join("patches.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(log).unwrap();
        std::io::Write::write_all(&mut f, br#"{"id":2,"timest"#).unwrap();
    }

    let store = common::disk_store(dir.path());
    let main = store.get_branch(PROJECT, "main").await.unwrap().unwrap();
    assert_eq!(main.seq().await.unwrap(), 1);
    assert_eq!(read_text(&main, "/one").await.as_deref(), Some("1"));

    main.write_file("/two", "2", None).await.unwrap();
    let ids: Vec<_> = main.history(None).await.unwrap().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

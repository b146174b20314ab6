use std::path::Path;

use branchstore::*;

pub const PROJECT: &str = "acme";

pub fn memory_store() -> Store {
    Store::open(OpenOptions::in_memory()).unwrap()
}

#[allow(dead_code)]
pub fn disk_store(dir: &Path) -> Store {
    Store::open(OpenOptions::on_disk(dir.join("store"))).unwrap()
}

#[allow(dead_code)]
pub async fn main_with_files(store: &Store) -> Branch {
    let main = store.branch(PROJECT, "main").await.unwrap();
    main.transactional_write(
        vec![
            WriteRequest::write("/hello.txt", "hello"),
            WriteRequest::write("/dir/a.txt", "aaa"),
            WriteRequest::write("/dir/b.txt", "bbb"),
        ],
        false,
    )
    .await
    .unwrap();
    main
}

#[allow(dead_code)]
pub fn meta(value: serde_json::Value) -> UserMetadata {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[allow(dead_code)]
pub async fn read_text(branch: &Branch, path: &str) -> Option<String> {
    branch
        .get_file(path)
        .await
        .unwrap()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
}

mod common;

use common::{embedding_records, ids, open_service, spawn_service, WAIT};
use std::io::Write;

#[tokio::test]
async fn restart_after_graceful_shutdown_keeps_counts() {
    let (service, tmp) = spawn_service();
    let c = service.create_collection("docs").unwrap();
    service.add_records(&c.id, embedding_records("id", 120)).unwrap();
    service.delete_records(&c.id, ids("id", 20)).unwrap();
    service.graceful_shutdown().await;
    let version = service.get_version(&c.id).unwrap();
    drop(service);

    let service = open_service(&tmp);
    let status = service.get_indexing_status(&c.id).unwrap();
    assert_eq!(status.total_ops, 140);
    assert_eq!(status.num_indexed_ops, 140);
    assert_eq!(service.get_version(&c.id).unwrap(), version);
    assert_eq!(service.indexed_record_count(&c.id).unwrap(), 100);
}

#[tokio::test]
async fn restart_after_abort_resumes_indexing() {
    let (service, tmp) = spawn_service();
    let c = service.create_collection("docs").unwrap();
    service.add_records(&c.id, embedding_records("id", 300)).unwrap();
    // No graceful shutdown: indexers are aborted wherever they were.
    drop(service);

    let service = open_service(&tmp);
    let status = service.get_indexing_status(&c.id).unwrap();
    assert_eq!(status.total_ops, 300);
    assert_eq!(status.num_indexed_ops + status.num_unindexed_ops, 300);

    let status = service.wait_for_indexing(&c.id, WAIT).await.unwrap();
    assert_eq!(status.num_indexed_ops, 300);
    assert_eq!(service.indexed_record_count(&c.id).unwrap(), 300);
}

#[tokio::test]
async fn torn_trailing_line_is_discarded_on_open() {
    let (service, tmp) = spawn_service();
    let c = service.create_collection("docs").unwrap();
    service.add_records(&c.id, embedding_records("id", 3)).unwrap();
    service.graceful_shutdown().await;
    drop(service);

    let log_path = tmp
        .path()
        .join(c.id.to_string())
        .join("oplog")
        .join("ops.jsonl");
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .unwrap();
    file.write_all(br#"{"seq":4,"timestamp_ms":1,"coll"#).unwrap();
    drop(file);

    let service = open_service(&tmp);
    assert_eq!(service.get_indexing_status(&c.id).unwrap().total_ops, 3);

    // New appends continue the sequence cleanly after the truncated tail.
    let seq = service.add_records(&c.id, embedding_records("more", 1)).unwrap();
    assert_eq!(seq, 4);
    let status = service.wait_for_indexing(&c.id, WAIT).await.unwrap();
    assert_eq!(status.total_ops, 4);
}

#[tokio::test]
async fn soft_deleted_collection_stays_gone_after_restart() {
    let (service, tmp) = spawn_service();
    let c = service.create_collection("temp").unwrap();
    service.add_records(&c.id, embedding_records("id", 5)).unwrap();
    service.delete_collection("temp").unwrap();
    service.graceful_shutdown().await;
    drop(service);

    let service = open_service(&tmp);
    assert!(service.get_indexing_status(&c.id).unwrap_err().is_not_found());
    assert!(service.list_collections().is_empty());
    assert!(!tmp.path().join(c.id.to_string()).exists());

    // The name is free again, under a new id.
    let again = service.create_collection("temp").unwrap();
    assert_ne!(again.id, c.id);
    assert_eq!(service.get_indexing_status(&again.id).unwrap().total_ops, 0);
}

use crate::db::*;
use crate::types::JobId;
use tempfile::NamedTempFile;

fn record(id: i64, status: &str) -> JobRecord {
    JobRecord {
        id,
        name: format!("Job {id}"),
        status: status.to_string(),
        message: String::new(),
        progress: 0.0,
        temp_dir: format!("/lib/tmp_1_{id}"),
        final_dir: format!("/lib/comic_1_{id}"),
        direct_urls: r#"["https://example.com/1.jpg","https://example.com/2.jpg"]"#.to_string(),
        direct_index: 0,
        direct_skipped: 0,
        direct_exts: "[null,null]".to_string(),
        headers: "{}".to_string(),
        meta: r#"{"comic_name":"Vol 1"}"#.to_string(),
        meta_path: None,
        post_processed: false,
        encryption: None,
        created_at: 1_700_000_000_000,
    }
}

#[tokio::test]
async fn test_upsert_inserts_then_updates() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut job = record(1, "starting");
    db.upsert_job(&job).await.unwrap();

    job.status = "downloading".into();
    job.direct_index = 1;
    job.direct_exts = r#"[".png",null]"#.into();
    job.encryption = Some("vault".into());
    job.post_processed = true;
    db.upsert_job(&job).await.unwrap();

    let stored = db.get_job(JobId(1)).await.unwrap().unwrap();
    assert_eq!(stored, job);
    assert_eq!(db.list_jobs().await.unwrap().len(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_list_delete_and_max_id() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert_eq!(db.max_job_id().await.unwrap(), 0);

    for id in [3, 1, 7] {
        db.upsert_job(&record(id, "completed")).await.unwrap();
    }
    let ids: Vec<i64> = db.list_jobs().await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![1, 3, 7]);
    assert_eq!(db.max_job_id().await.unwrap(), 7);

    db.delete_job(JobId(7)).await.unwrap();
    assert!(db.get_job(JobId(7)).await.unwrap().is_none());
    assert_eq!(db.max_job_id().await.unwrap(), 3);

    db.close().await;
}

use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_pending_cleanup_ledger() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.add_pending_cleanup("/lib/trash_1_ab_tmp", CleanupKind::Folder)
        .await
        .unwrap();
    db.add_pending_cleanup("/lib/meta.json", CleanupKind::File)
        .await
        .unwrap();
    // Duplicates are ignored
    db.add_pending_cleanup("/lib/trash_1_ab_tmp", CleanupKind::Folder)
        .await
        .unwrap();

    let folders = db.list_pending_cleanup(CleanupKind::Folder).await.unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].path, "/lib/trash_1_ab_tmp");
    assert_eq!(folders[0].kind, "folder");

    let files = db.list_pending_cleanup(CleanupKind::File).await.unwrap();
    assert_eq!(files.len(), 1);

    db.remove_pending_cleanup("/lib/meta.json").await.unwrap();
    assert!(db.list_pending_cleanup(CleanupKind::File).await.unwrap().is_empty());
    assert_eq!(db.list_pending_cleanup(CleanupKind::Folder).await.unwrap().len(), 1);

    db.close().await;
}

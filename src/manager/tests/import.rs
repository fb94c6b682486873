use super::*;
use crate::error::JobError;
use serde_json::json;

async fn write_folder(dir: &std::path::Path, files: &[(&str, Vec<u8>)]) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    for (name, body) in files {
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }
}

#[tokio::test]
async fn test_import_local_folder_creates_item() {
    let (manager, temp_dir) = create_test_manager().await;
    let mut events = manager.subscribe();
    let source = temp_dir.path().join("scans").join("Vol 3");
    write_folder(
        &source,
        &[
            ("1.png", png_page(100, 150)),
            ("2.png", png_page(200, 150)),
            // Not a parseable image, so its size can only come from the hint
            ("10.jpg", vec![0x42; 300]),
            ("notes.txt", b"not a page".to_vec()),
        ],
    )
    .await;

    let hint = vec![
        json!({ "file": "002.png.enc", "w": 1, "h": 1 }),
        json!({ "file": "003.jpg.enc", "w": 640, "h": 960 }),
        json!({ "file": "../../outside.enc", "w": 5, "h": 5 }),
        json!({ "file": "009.png.enc", "w": 5, "h": 5 }),
    ];
    let outcome = manager
        .import_local_folder(&source, JobMeta::default(), Some(hint))
        .await
        .unwrap();

    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.skipped, 0);
    assert!(outcome.final_dir.starts_with(manager.config.library_root()));
    let dir_name = outcome.final_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(dir_name.starts_with("comic_"));

    // The source folder is left as it was
    assert!(source.join("1.png").exists());
    assert!(source.join("10.jpg").exists());

    assert_eq!(
        read_library_page(&manager, &outcome.final_dir, "002.png").await,
        png_page(200, 150)
    );

    let root = manager.config.library_root().clone();
    let index: IndexRecord =
        read_encrypted_json(manager.vault.as_ref(), &root, &outcome.final_dir, INDEX_FILE)
            .await
            .unwrap();
    assert_eq!(index.title.as_deref(), Some("Vol 3"));
    let files: Vec<&str> = index.page_entries.iter().map(|e| e.file.as_str()).collect();
    assert_eq!(files, vec!["001.png.enc", "002.png.enc", "003.jpg.enc"]);
    assert_eq!(index.page_entries[1].w, Some(200));
    assert_eq!(index.page_entries[2].w, Some(640));
    assert_eq!(index.page_entries[2].h, Some(960));

    let metadata: MetadataRecord = read_encrypted_json(
        manager.vault.as_ref(),
        &root,
        &outcome.final_dir,
        crate::library::METADATA_FILE,
    )
    .await
    .unwrap();
    assert_eq!(metadata.download_source, "import");
    assert_eq!(metadata.moved, 3);
    assert_eq!(metadata.meta.comic_name.as_deref(), Some("Vol 3"));

    let mut library_changed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::LibraryChanged { .. }) {
            library_changed = true;
        }
    }
    assert!(library_changed);
}

#[tokio::test]
async fn test_import_refusals_leave_no_item() {
    let (manager, temp_dir) = create_test_manager().await;
    let root = manager.config.library_root().clone();

    let missing = temp_dir.path().join("nowhere");
    let err = manager
        .import_local_folder(&missing, JobMeta::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Job(JobError::ImportSourceMissing { .. })));

    let empty = temp_dir.path().join("text-only");
    write_folder(&empty, &[("readme.txt", b"hello".to_vec())]).await;
    let err = manager
        .import_local_folder(&empty, JobMeta::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Job(JobError::ImportNoImages { .. })));

    let mut dirs = tokio::fs::read_dir(&root).await.unwrap();
    while let Some(entry) = dirs.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.starts_with("comic_"), "left behind {name}");
    }
}

#[tokio::test]
async fn test_import_needs_an_unlocked_vault() {
    let (manager, temp_dir) = create_test_manager_with(Arc::new(MasterKeyVault::locked())).await;
    let source = temp_dir.path().join("Vol 1");
    write_folder(&source, &[("1.png", png_page(10, 10))]).await;

    let err = manager
        .import_local_folder(&source, JobMeta::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cipher(crate::error::CipherError::VaultLocked)));

    let (plain, temp_dir) = create_test_manager_with(Arc::new(NoVault)).await;
    let source = temp_dir.path().join("Vol 1");
    write_folder(&source, &[("1.png", png_page(10, 10))]).await;
    let err = plain
        .import_local_folder(&source, JobMeta::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Cipher(crate::error::CipherError::VaultUninitialized)
    ));
}

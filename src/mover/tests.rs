use super::*;
use crate::crypto::KEY_LEN;
use crate::vault::{MasterKeyVault, Vault};
use std::sync::Mutex;
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
    cipher: DirectCipher,
    vault: Arc<MasterKeyVault>,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let vault = Arc::new(MasterKeyVault::unlocked([3; KEY_LEN]));
        let cipher = DirectCipher::new(vault.clone(), root.path().to_path_buf(), false);
        Self {
            root,
            cipher,
            vault,
        }
    }

    fn temp(&self) -> PathBuf {
        self.root.path().join("tmp_1_1")
    }

    fn final_dir(&self) -> PathBuf {
        self.root.path().join("comic_1_1")
    }

    async fn write_plain(&self, rel: &str, body: &[u8]) -> PathBuf {
        let path = self.temp().join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    async fn write_encrypted(&self, rel: &str, body: &[u8]) -> PathBuf {
        let path = self.temp().join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let mut reader: &[u8] = body;
        let outcome = self
            .cipher
            .encrypt_stream_to_file(&self.cipher.rel_path(&path), &mut reader, &path)
            .await
            .unwrap();
        self.cipher.write_meta(&path, &outcome).await.unwrap();
        path
    }

    async fn read_page(&self, name: &str) -> Vec<u8> {
        let logical = self.final_dir().join(name);
        self.vault
            .decrypt_file(
                &self.cipher.rel_path(&logical),
                &self.final_dir().join(format!("{name}.enc")),
            )
            .await
            .unwrap()
    }
}

fn png(tag: u8) -> Vec<u8> {
    let mut body = b"\x89PNG\r\n\x1a\n\0\0\0\x0dIHDR".to_vec();
    body.extend_from_slice(&64u32.to_be_bytes());
    body.extend_from_slice(&32u32.to_be_bytes());
    body.extend_from_slice(&[tag; 100]);
    body
}

#[tokio::test]
async fn test_flatten_uses_natural_order() {
    let fx = Fixture::new();
    fx.write_plain("a/2.png", &png(1)).await;
    fx.write_plain("a/10.png", &png(2)).await;
    fx.write_plain("b/2.PNG", &png(3)).await;
    fx.write_plain("notes.txt", b"ignored").await;

    let report = move_to_vault(
        &fx.cipher,
        MoveSource::Plain,
        &fx.temp(),
        &fx.final_dir(),
        &MoveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.moved, 3);
    assert_eq!(report.skipped, 0);
    let names: Vec<_> = report
        .encrypted_paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["001.png.enc", "002.png.enc", "003.png.enc"]);

    assert_eq!(fx.read_page("001.png").await, png(1));
    assert_eq!(fx.read_page("002.png").await, png(2));
    assert_eq!(fx.read_page("003.png").await, png(3));

    let page = report.results[0].page.as_ref().unwrap();
    assert_eq!((page.w, page.h), (Some(64), Some(32)));
    assert_eq!(page.bytes, Some(png(1).len() as u64));
    assert!(!fx.temp().join("a/2.png").exists());
}

#[tokio::test]
async fn test_encrypted_sources_are_reencrypted_and_cleaned() {
    let fx = Fixture::new();
    let first = fx.write_encrypted("001.jpg", &png(7)).await;
    fx.write_encrypted("002.jpg", &png(8)).await;

    let report = move_to_vault(
        &fx.cipher,
        MoveSource::Encrypted,
        &fx.temp(),
        &fx.final_dir(),
        &MoveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 2);
    assert_eq!(report.plaintext_fallbacks, 0);
    assert_eq!(fx.read_page("001.jpg").await, png(7));
    assert_eq!(fx.read_page("002.jpg").await, png(8));
    assert!(!first.exists());
    assert!(!meta_path(&first).exists());
    assert!(!meta_backup_path(&first).exists());
}

#[tokio::test]
async fn test_rerun_counts_existing_outputs_as_moved() {
    let fx = Fixture::new();
    fx.write_plain("001.png", &png(1)).await;
    fx.write_plain("002.png", &png(2)).await;
    let options = MoveOptions {
        delete_originals: false,
        ..Default::default()
    };

    let first = move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();
    assert_eq!(first.moved, 2);

    let second = move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();
    assert_eq!(second.moved, 2);
    assert_eq!(second.skipped, 0);
    assert!(second.results.iter().all(|r| r.page.is_none()));
}

#[tokio::test]
async fn test_one_bad_file_does_not_stop_the_rest() {
    let fx = Fixture::new();
    fx.write_encrypted("001.jpg", &png(1)).await;
    let broken = fx.write_encrypted("002.jpg", &png(2)).await;
    fx.write_encrypted("003.jpg", &png(3)).await;

    // Corrupt ciphertext that does not sniff as an image
    let mut bytes = tokio::fs::read(&broken).await.unwrap();
    bytes[20] ^= 0xff;
    tokio::fs::write(&broken, &bytes).await.unwrap();

    let report = move_to_vault(
        &fx.cipher,
        MoveSource::Encrypted,
        &fx.temp(),
        &fx.final_dir(),
        &MoveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.moved, 2);
    assert_eq!(report.skipped, 1);
    assert!(report.first_error.as_deref().unwrap().contains("authentication failed"));

    let failed = &report.results[1];
    assert_eq!(failed.out, None);
    assert_eq!(failed.error_code.as_deref(), Some("auth_failed"));
    assert!(!fx.final_dir().join("002.jpg.enc").exists());
    assert!(broken.exists(), "failed source is kept");
}

#[tokio::test]
async fn test_plaintext_in_encrypted_run_falls_back() {
    let fx = Fixture::new();
    fx.write_encrypted("001.jpg", &png(1)).await;
    fx.write_plain("002.jpg", &png(2)).await;

    let report = move_to_vault(
        &fx.cipher,
        MoveSource::Encrypted,
        &fx.temp(),
        &fx.final_dir(),
        &MoveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 2);
    assert_eq!(report.plaintext_fallbacks, 1);
    assert_eq!(fx.read_page("002.jpg").await, png(2));
}

#[tokio::test]
async fn test_detect_source_and_progress() {
    let fx = Fixture::new();
    fx.write_encrypted("001.jpg", &png(1)).await;
    fx.write_encrypted("002.jpg", &png(2)).await;
    assert_eq!(detect_source(&fx.temp(), None, 8).await, MoveSource::Encrypted);

    fx.write_plain("003.jpg", &png(3)).await;
    assert_eq!(detect_source(&fx.temp(), None, 8).await, MoveSource::Plain);
    assert_eq!(detect_source(&fx.temp(), None, 2).await, MoveSource::Encrypted);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = MoveOptions {
        concurrency: 1,
        on_progress: Some(Arc::new(move |p: MoveProgress| sink.lock().unwrap().push(p))),
        ..Default::default()
    };
    move_to_vault(&fx.cipher, MoveSource::Encrypted, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.last().unwrap().done, 3);
    assert!(seen.iter().all(|p| p.total == 3 && !p.skipped));
}

#[tokio::test]
async fn test_only_files_keeps_positions_for_missing_sources() {
    let fx = Fixture::new();
    let a = fx.write_plain("001.png", &png(1)).await;
    let b = fx.write_plain("002.png", &png(2)).await;
    let options = MoveOptions {
        only_files: Some(vec![a.clone(), b.clone()]),
        ..Default::default()
    };
    move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();
    assert!(!a.exists() && !b.exists());

    // Sources are gone; outputs are found by position
    let again = move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();
    assert_eq!(again.moved, 2);
    assert_eq!(fx.read_page("002.png").await, png(2));
}

#[tokio::test]
async fn test_torn_output_is_rewritten_from_source() {
    let fx = Fixture::new();
    let source = fx.write_plain("001.png", &png(1)).await;
    let keep = MoveOptions {
        delete_originals: false,
        ..Default::default()
    };
    move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &keep)
        .await
        .unwrap();

    // Header intact, body cut short
    let out = fx.final_dir().join("001.png.enc");
    let bytes = tokio::fs::read(&out).await.unwrap();
    tokio::fs::write(&out, &bytes[..bytes.len() - 40]).await.unwrap();

    let report = move_to_vault(
        &fx.cipher,
        MoveSource::Plain,
        &fx.temp(),
        &fx.final_dir(),
        &MoveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 1);
    assert!(report.results[0].page.is_some(), "output was rewritten");
    assert_eq!(fx.read_page("001.png").await, png(1));
    assert!(!source.exists());
}

#[tokio::test]
async fn test_equivalent_input_paths_are_listed_once() {
    let fx = Fixture::new();
    let first = fx.write_plain("a/001.png", &png(1)).await;
    let second = fx.write_plain("a/002.png", &png(2)).await;
    let inputs = vec![
        first.clone(),
        fx.temp().join("a/./001.png"),
        fx.temp().join("a/../a/001.png"),
        PathBuf::from("a/002.png"),
    ];

    let listed = list_inputs(&fx.temp(), Some(&inputs)).await;
    assert_eq!(listed, vec![first, second]);

    let options = MoveOptions {
        only_files: Some(inputs),
        ..Default::default()
    };
    let report = move_to_vault(&fx.cipher, MoveSource::Plain, &fx.temp(), &fx.final_dir(), &options)
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.moved, 2);
    assert_eq!(fx.read_page("002.png").await, png(2));
}

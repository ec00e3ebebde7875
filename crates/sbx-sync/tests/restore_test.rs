mod common;

use common::{sample, Harness};
use sbx_core::types::{DownloadPhase, SyncStatus};
use sbx_core::SbxError;
use sbx_crypto::Session;
use sbx_storage::StorageClient;
use sbx_sync::{CekStore, DirectorySink, DownloadOrchestrator, PhaseProgress, RecordStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn backup_then_restore_all() {
    let h = Harness::new();
    let a = sample(5000, 1);
    let b = sample(70_000, 2);
    h.write_photo("beach.jpg", &a);
    h.write_photo("party.mp4", &b);
    h.orchestrator().run().await.unwrap();

    let outcomes = h.downloader().restore_all().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    for (_, outcome) in &outcomes {
        assert!(outcome.is_ok(), "{outcome:?}");
    }

    let restored = h.root.join("restored");
    assert_eq!(std::fs::read(restored.join("beach.jpg")).unwrap(), a);
    assert_eq!(std::fs::read(restored.join("party.mp4")).unwrap(), b);
}

#[tokio::test]
async fn restore_returns_metadata() {
    let h = Harness::new();
    let content = sample(1234, 3);
    let path = h.write_photo("IMG_42.jpg", &content);
    h.orchestrator().run().await.unwrap();
    let record = h.record_for(&path).await;

    let restored = h.downloader().restore(&record.id).await.unwrap();
    assert_eq!(restored.bytes, 1234);
    assert_eq!(restored.metadata.original_name, "IMG_42.jpg");
    assert_eq!(restored.metadata.mime_type, "image/jpeg");
    assert_eq!(restored.metadata.cek_id, record.cek_id);
    assert_eq!(restored.metadata.device_id, h.ctx.device.device_id);
    assert_eq!(Some(restored.metadata.content_hash.clone()), record.content_hash);
}

#[tokio::test]
async fn restore_unknown_or_unsynced_record_fails() {
    let h = Harness::new();
    let path = h.write_photo("x.jpg", &sample(100, 4));
    h.storage.set_fault(common::Fault::Status(403));
    h.orchestrator().run().await.unwrap();
    let record = h.record_for(&path).await;
    assert_eq!(record.status, SyncStatus::Failed);

    let downloader = h.downloader();
    let err = downloader.restore(&record.id).await.unwrap_err();
    assert!(matches!(err.source, SbxError::InvalidInput(_)));
    let err = downloader.restore("no-such-id").await.unwrap_err();
    assert!(matches!(err.source, SbxError::InvalidInput(_)));
}

#[tokio::test]
async fn missing_metadata_reports_phase() {
    let h = Harness::new();
    let content = sample(900, 5);
    let path = h.write_photo("m.jpg", &content);
    h.orchestrator().run().await.unwrap();
    h.storage
        .delete_file(&h.metadata_path_for(&content, None))
        .await
        .unwrap();

    let record = h.record_for(&path).await;
    let err = h.downloader().restore(&record.id).await.unwrap_err();
    assert_eq!(err.phase, DownloadPhase::DownloadingMetadata);
    assert_eq!(err.source.status(), Some(404));
    assert!(!h.root.join("restored").join("m.jpg").exists());
}

#[tokio::test]
async fn tampered_blob_is_rejected() {
    let h = Harness::new();
    let content = sample(3000, 6);
    let path = h.write_photo("t.jpg", &content);
    h.orchestrator().run().await.unwrap();

    let data_path = h.data_path_for(&content, None);
    let mut blob = h.storage.get(&data_path).await.unwrap();
    blob[100] ^= 0x01;
    h.storage.put(&data_path, &blob).await;

    let record = h.record_for(&path).await;
    let err = h.downloader().restore(&record.id).await.unwrap_err();
    assert_eq!(err.phase, DownloadPhase::DecryptingFile);
    assert!(matches!(err.source, SbxError::AuthenticationFailure(_)));
    assert!(!h.root.join("restored").join("t.jpg").exists());
}

#[tokio::test]
async fn wrong_master_key_cannot_restore() {
    let h = Harness::new();
    let path = h.write_photo("k.jpg", &sample(700, 7));
    h.orchestrator().run().await.unwrap();
    let record = h.record_for(&path).await;

    let other = Harness::context(&h.records, &h.storage, [9u8; 32]);
    let downloader = DownloadOrchestrator::new(
        other,
        Arc::new(DirectorySink::new(h.root.join("restored"))),
        "backup",
    );
    let err = downloader.restore(&record.id).await.unwrap_err();
    assert_eq!(err.phase, DownloadPhase::GettingCek);
    assert!(matches!(err.source, SbxError::AuthenticationFailure(_)));
}

#[tokio::test]
async fn locked_session_cannot_restore() {
    let h = Harness::new();
    let path = h.write_photo("l.jpg", &sample(700, 8));
    h.orchestrator().run().await.unwrap();
    let record = h.record_for(&path).await;

    h.ctx.session.lock();
    let err = h.downloader().restore(&record.id).await.unwrap_err();
    assert_eq!(err.phase, DownloadPhase::GettingCek);
    assert!(matches!(err.source, SbxError::Locked));
}

#[tokio::test]
async fn restore_reports_each_phase_in_order() {
    let h = Harness::new();
    let content = sample(150_000, 9);
    let path = h.write_photo("phases.mp4", &content);
    h.orchestrator().run().await.unwrap();
    let record = h.record_for(&path).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let progress: PhaseProgress =
        Arc::new(move |phase: DownloadPhase, done: u64, total: u64| {
            seen.lock().unwrap().push((phase, done, total));
        });
    h.downloader()
        .restore_with_progress(&record.id, Some(progress))
        .await
        .unwrap();

    let events = events.lock().unwrap().clone();
    let mut phases: Vec<DownloadPhase> = events.iter().map(|(p, _, _)| *p).collect();
    phases.dedup();
    assert_eq!(
        phases,
        vec![
            DownloadPhase::DownloadingFile,
            DownloadPhase::DownloadingMetadata,
            DownloadPhase::GettingCek,
            DownloadPhase::DecryptingMetadata,
            DownloadPhase::DecryptingFile,
            DownloadPhase::SavingFile,
        ]
    );
    let blob_len = content.len() as u64 + 29;
    assert!(events
        .iter()
        .any(|e| *e == (DownloadPhase::DecryptingFile, blob_len, blob_len)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_yields_one_key() {
    let h = Harness::new();
    let store = Arc::new(CekStore::new(
        h.records.clone() as Arc<dyn RecordStore>,
        "device-a",
    ));
    let session: Arc<Session> = h.ctx.session.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            store.get_or_create_cek("x", &session).await.unwrap()
        }));
    }
    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap());
    }
    assert!(keys.windows(2).all(|w| w[0] == w[1]));

    let again = tokio::time::timeout(
        Duration::from_secs(5),
        store.get_or_create_cek("x", &session),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(again, keys[0]);
}

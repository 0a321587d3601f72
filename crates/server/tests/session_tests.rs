//! End-to-end tests of the duplex session endpoint.

mod common;

use common::{PROVIDER_ID, SCOPE, TestServer, WsPeer, scope_bucket, upload_request};
use ferry_core::hash::sha256_hex;
use ferry_metadata::FileRepo;
use ferry_core::{
    DownloadChecksum, DownloadCompleteError, DownloadJob, Event, FileRef, Frame, FrameKind, Reply,
    UploadChecksum, UploadCreateResult, UploadError, UploadJob, part_key,
};

fn expect_job(result: &UploadCreateResult) -> UploadJob {
    match result {
        UploadCreateResult::Job(job) => job.clone(),
        other => panic!("expected a job, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_or_invalid_token_is_unauthorized() {
    let server = TestServer::new().await;

    assert_eq!(WsPeer::refused_status(&server.session_url(), "").await, 401);
    assert_eq!(
        WsPeer::refused_status(&server.session_url(), "not.a-token").await,
        401
    );

    let other = ferry_signer::TokenSigner::new(ferry_signer::KeyPair::generate("other"));
    let foreign = other
        .sign(&ferry_core::TokenClaims::download())
        .unwrap();
    assert_eq!(
        WsPeer::refused_status(&server.session_url(), &foreign).await,
        401
    );
}

#[tokio::test]
async fn test_unknown_provider_is_forbidden() {
    let server = TestServer::new().await;
    let token = server.upload_token(SCOPE, "nope");
    assert_eq!(
        WsPeer::refused_status(&server.session_url(), &token).await,
        403
    );
}

#[tokio::test]
async fn test_upload_create_complete_then_exists() {
    let server = TestServer::new().await;
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut peer = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();

    let first = upload_request("dir/a.bin", b"hello ", 0, 11);
    let second = upload_request("dir/a.bin", b"world", 6, 11);

    let reply = peer
        .request(Event::UploadCreate(vec![first.clone(), second.clone()]))
        .await;
    let Reply::UploadCreate(results) = reply else {
        panic!("unexpected reply: {reply:?}");
    };
    assert_eq!(results.len(), 2);
    let job = expect_job(&results[0]);
    assert_eq!(job.range, first.range);
    assert!(job.url.contains(&scope_bucket()));
    assert!(job.url.ends_with("dir/a.bin.0-5?method=PUT"));
    assert_eq!(expect_job(&results[1]).range, second.range);

    // Announcing again before completion hands out the URL again.
    let reply = peer.request(Event::UploadCreate(vec![first.clone()])).await;
    assert!(matches!(
        reply,
        Reply::UploadCreate(ref r) if matches!(r[0], UploadCreateResult::Job(_))
    ));

    let reply = peer.request(Event::UploadComplete(job)).await;
    assert_eq!(reply, Reply::UploadComplete(None));

    let reply = peer.request(Event::UploadCreate(vec![first])).await;
    assert_eq!(
        reply,
        Reply::UploadCreate(vec![UploadCreateResult::Error(UploadError::UploadExists)])
    );

    peer.close().await;
}

#[tokio::test]
async fn test_upload_create_rejections_are_index_aligned() {
    let server = TestServer::new().await;
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut peer = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();

    let good = upload_request("f", b"abcd", 0, 8);
    let wrong_size = upload_request("f", b"efgh", 4, 9);
    let mut bad_md5 = upload_request("g", b"abcd", 0, 4);
    bad_md5.checksum_md5 = "zz".to_string();

    let reply = peer
        .request(Event::UploadCreate(vec![good, wrong_size, bad_md5]))
        .await;
    let Reply::UploadCreate(results) = reply else {
        panic!("unexpected reply: {reply:?}");
    };
    assert!(matches!(results[0], UploadCreateResult::Job(_)));
    assert_eq!(results[1], UploadCreateResult::Error(UploadError::Unknown));
    assert_eq!(results[2], UploadCreateResult::Error(UploadError::Unknown));
}

#[tokio::test]
async fn test_complete_unknown_part_is_unknown() {
    let server = TestServer::new().await;
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut peer = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();

    let request = upload_request("never-announced", b"abc", 0, 3);
    let job = UploadJob {
        path: request.path,
        range: request.range,
        checksum_md5: request.checksum_md5,
        size: request.size,
        url: "http://storage.test/x".to_string(),
    };
    let reply = peer.request(Event::UploadComplete(job)).await;
    assert_eq!(reply, Reply::UploadComplete(Some(UploadError::Unknown)));
}

#[tokio::test]
async fn test_upload_checksum_validated_and_stored() {
    let server = TestServer::new().await;
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut peer = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();

    let reply = peer
        .request(Event::UploadChecksum(UploadChecksum {
            path: "f".to_string(),
            checksum_sha256: "abc".to_string(),
        }))
        .await;
    assert_eq!(reply, Reply::UploadChecksum(Some(UploadError::Unknown)));

    let digest = sha256_hex(b"contents");
    let reply = peer
        .request(Event::UploadChecksum(UploadChecksum {
            path: "f".to_string(),
            checksum_sha256: digest.to_uppercase(),
        }))
        .await;
    assert_eq!(reply, Reply::UploadChecksum(None));

    let file = server.metadata.get_file(SCOPE, "f").await.unwrap().unwrap();
    assert_eq!(file.checksum_sha256.as_deref(), Some(digest.as_str()));
}

#[tokio::test]
async fn test_events_outside_role_are_rejected() {
    let server = TestServer::new().await;

    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut upload = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();
    let reply = upload.request(Event::DownloadComplete(Vec::new())).await;
    assert!(matches!(reply, Reply::Rejected { .. }));

    let mut download = WsPeer::connect(&server.session_url(), &server.download_token(), None)
        .await
        .unwrap();
    let reply = download.request(Event::UploadCreate(Vec::new())).await;
    match reply {
        Reply::Rejected { reason } => assert!(reason.contains("upload:create")),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_then_download_round() {
    let server = TestServer::new().await;
    let data = b"hello world";

    // Upload side: announce, "PUT" the bytes, complete, send the checksum.
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut upload = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();
    let request = upload_request("dir/a.bin", data, 0, data.len() as u64);
    let Reply::UploadCreate(results) = upload.request(Event::UploadCreate(vec![request])).await
    else {
        panic!("unexpected reply");
    };
    let job = expect_job(&results[0]);
    server
        .storage
        .put_object(&scope_bucket(), &job.part_key(), data)
        .unwrap();
    assert_eq!(
        upload.request(Event::UploadComplete(job.clone())).await,
        Reply::UploadComplete(None)
    );
    let checksum = sha256_hex(data);
    assert_eq!(
        upload
            .request(Event::UploadChecksum(UploadChecksum {
                path: "dir/a.bin".to_string(),
                checksum_sha256: checksum.clone(),
            }))
            .await,
        Reply::UploadChecksum(None)
    );

    // Download side: connecting wakes the loop, which offers the stored part.
    let mut download = WsPeer::connect(
        &server.session_url(),
        &server.download_token(),
        Some("dl-1"),
    )
    .await
    .unwrap();
    // The job request and the checksum notification may interleave with a
    // pass that started before the subscription.
    let mut jobs: Option<Vec<DownloadJob>> = None;
    let mut checksum_event = None;
    while jobs.is_none() || checksum_event.is_none() {
        let frame = download.next_frame().await;
        match frame.kind {
            FrameKind::Request(Event::DownloadCreate(batch)) => {
                download.send(Frame::reply(frame.id, Reply::Received)).await;
                jobs = Some(batch);
            }
            FrameKind::Notify(event @ Event::DownloadChecksum(_)) => checksum_event = Some(event),
            _ => {}
        }
    }
    let jobs = jobs.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].n, SCOPE);
    assert_eq!(jobs[0].path, "dir/a.bin");
    assert_eq!(jobs[0].storage_provider_id, PROVIDER_ID);
    assert_eq!(jobs[0].size, data.len() as u64);
    assert_eq!(
        checksum_event,
        Some(Event::DownloadChecksum(DownloadChecksum {
            n: SCOPE.to_string(),
            path: "dir/a.bin".to_string(),
            checksum_sha256: checksum,
        }))
    );

    let reply = download.request(Event::DownloadComplete(jobs.clone())).await;
    assert_eq!(reply, Reply::DownloadComplete(vec![None]));
    assert!(
        !server
            .storage
            .contains(&scope_bucket(), &part_key("dir/a.bin", &jobs[0].range))
    );

    let mut unknown = jobs[0].clone();
    unknown.storage_provider_id = "gone".to_string();
    let reply = download.request(Event::DownloadComplete(vec![unknown])).await;
    assert_eq!(
        reply,
        Reply::DownloadComplete(vec![Some(DownloadCompleteError::UnknownStorageProvider)])
    );

    // Verification arrives as a notification; poll the ledger for it.
    download
        .send(Frame::notify(Event::DownloadVerified(FileRef {
            n: SCOPE.to_string(),
            path: "dir/a.bin".to_string(),
        })))
        .await;
    let mut verified = false;
    for _ in 0..50 {
        let file = server
            .metadata
            .get_file(SCOPE, "dir/a.bin")
            .await
            .unwrap()
            .unwrap();
        if file.verified {
            verified = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(verified);
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let server = TestServer::new().await;
    let mut download = WsPeer::connect(&server.session_url(), &server.download_token(), None)
        .await
        .unwrap();
    let token = server.upload_token(SCOPE, PROVIDER_ID);
    let mut upload = WsPeer::connect(&server.session_url(), &token, None)
        .await
        .unwrap();

    server.handle.shutdown();

    assert_eq!(download.expect_close().await, Some(1001));
    assert_eq!(upload.expect_close().await, Some(1001));
    tokio::time::timeout(std::time::Duration::from_secs(10), server.handle.wait())
        .await
        .expect("server did not stop");
}

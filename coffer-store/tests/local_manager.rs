//! The owner/third-party chunk lifecycle over the file backend and the
//! local chunk manager, the way cooperating local processes drive it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::SeedableRng;

use coffer_store::actions::appendable::APPEND_FORBIDDEN_TAG;
use coffer_store::{
    AppendableByAll, ChunkError, ChunkName, ChunkType, FileChunkStore, GetOutput, Keys,
    LocalChunkManager, SignedData,
};

fn keys(seed: u64) -> Keys {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
    Keys::generate(Bytes::from(format!("identity-{seed}")), &b""[..], &mut rng)
}

struct Bench {
    manager: LocalChunkManager,
    _store_dir: tempfile::TempDir,
    _lock_dir: tempfile::TempDir,
}

fn bench(latency: Duration) -> Bench {
    let store_dir = tempfile::tempdir().unwrap();
    let lock_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileChunkStore::open(store_dir.path(), 0).unwrap());
    let manager = LocalChunkManager::new(store, lock_dir.path(), latency, latency);
    Bench {
        manager,
        _store_dir: store_dir,
        _lock_dir: lock_dir,
    }
}

fn parse(output: GetOutput) -> AppendableByAll {
    AppendableByAll::from_bytes(&output.into_bytes()).unwrap()
}

#[tokio::test]
async fn owner_store_append_drain_delete_lifecycle() {
    let bench = bench(Duration::ZERO);
    let owner = keys(1);
    let friend = keys(2);

    let chunk = AppendableByAll::new_owned(&owner.signing_key(), true);
    let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);
    bench
        .manager
        .store(&name, &chunk.to_bytes(), &owner.public_key)
        .await
        .unwrap();

    // A third party appends a signed note.
    let note = SignedData::sign(&b"hello owner"[..], &friend.signing_key());
    bench
        .manager
        .modify(&name, &note.to_bytes(), &friend.public_key)
        .await
        .unwrap();

    // The non-owner read is restricted to the identity key.
    let restricted = bench
        .manager
        .get(&name, None, &friend.public_key)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(restricted, GetOutput::IdentityOnly(_)));

    // The owner sees the appendix once; the read drains it.
    let full = bench
        .manager
        .get(&name, None, &owner.public_key)
        .await
        .unwrap()
        .unwrap();
    let parsed = parse(full);
    assert_eq!(parsed.appendices.len(), 1);
    assert_eq!(parsed.appendices[0].data, Bytes::from_static(b"hello owner"));

    let drained = bench
        .manager
        .get(&name, None, &owner.public_key)
        .await
        .unwrap()
        .unwrap();
    assert!(parse(drained).appendices.is_empty());

    // Delete needs the owner's proof, and is idempotent afterwards.
    assert_eq!(
        bench.manager.delete(&name, None, &owner.public_key).await,
        Err(ChunkError::NotOwner)
    );
    let proof = SignedData::sign(&b"remove"[..], &owner.signing_key()).to_bytes();
    bench
        .manager
        .delete(&name, Some(&proof), &owner.public_key)
        .await
        .unwrap();
    bench
        .manager
        .delete(&name, Some(&proof), &owner.public_key)
        .await
        .unwrap();
    assert_eq!(
        bench.manager.has(&name).await,
        Err(ChunkError::FailedToFindChunk)
    );
}

#[tokio::test]
async fn disallowed_appends_leave_the_chunk_unchanged() {
    let bench = bench(Duration::ZERO);
    let owner = keys(3);
    let stranger = keys(4);

    let chunk = AppendableByAll::new_owned(&owner.signing_key(), false);
    assert_eq!(
        chunk.allow_others_to_append.data.first(),
        Some(&APPEND_FORBIDDEN_TAG)
    );
    let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);
    bench
        .manager
        .store(&name, &chunk.to_bytes(), &owner.public_key)
        .await
        .unwrap();
    let version_before = bench.manager.version(&name).unwrap();

    let note = SignedData::sign(&b"let me in"[..], &stranger.signing_key());
    assert_eq!(
        bench
            .manager
            .modify(&name, &note.to_bytes(), &stranger.public_key)
            .await,
        Err(ChunkError::AppendDisallowed)
    );
    assert_eq!(bench.manager.version(&name).unwrap(), version_before);
}

#[tokio::test]
async fn simulated_latency_applies_per_operation() {
    let bench = bench(Duration::from_millis(50));
    let owner = keys(5);
    let chunk = AppendableByAll::new_owned(&owner.signing_key(), true);
    let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);

    let begin = std::time::Instant::now();
    bench
        .manager
        .store(&name, &chunk.to_bytes(), &owner.public_key)
        .await
        .unwrap();
    assert!(begin.elapsed() >= Duration::from_millis(50));

    // The version short-circuit skips the latency entirely.
    let version = bench.manager.version(&name).unwrap();
    let begin = std::time::Instant::now();
    let unchanged = bench
        .manager
        .get(&name, Some(version.as_ref()), &owner.public_key)
        .await
        .unwrap();
    assert!(unchanged.is_none());
    assert!(begin.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn sizes_are_reported_through_the_manager() {
    let bench = bench(Duration::ZERO);
    let owner = keys(6);
    let chunk = AppendableByAll::new_owned(&owner.signing_key(), true);
    let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);

    assert_eq!(bench.manager.storage_size(), 0);
    assert_eq!(bench.manager.storage_capacity(), 0);
    bench
        .manager
        .store(&name, &chunk.to_bytes(), &owner.public_key)
        .await
        .unwrap();
    assert_eq!(
        bench.manager.storage_size(),
        chunk.to_bytes().len() as u64
    );
}

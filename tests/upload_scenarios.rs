//! Scenario tests for the upload engine against a scripted backend.
//!
//! The fake transport behaves like the real backend (offset tracking,
//! conflict answers, artifact minting) and lets tests inject faults on
//! specific requests. Sizes are scaled down so the suite stays fast; the
//! chunk arithmetic is size-parametric.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use media_uplink::upload::transport::{
    DirectSubmission, SessionRequest, TransportError, UploadTransport, WireResponse,
};
use media_uplink::upload::{
    RetryPolicy, SourceResolver, UploadError, UploadOptions, Uploader,
};

const CHUNK: usize = 1024;
const DIRECT_MAX: u64 = 2048;

/// What the scripted backend does to one incoming chunk request, keyed by
/// the 1-based global request index.
#[derive(Clone, Copy)]
enum PatchFault {
    /// Answer the given status without applying the bytes.
    Reject(u16),
    /// Answer the given status and body without applying the bytes.
    RejectBody(u16, &'static str),
    /// Apply the bytes, then answer the given status (a lost ack).
    ApplyThenReject(u16),
}

#[derive(Default)]
struct BackendState {
    offset: u64,
    total_len: u64,
    received: Vec<u8>,
    acked_offsets: Vec<u64>,
}

struct FakeBackend {
    state: Mutex<BackendState>,
    patch_faults: Mutex<HashMap<u32, PatchFault>>,
    create_script: Mutex<Vec<WireResponse>>,
    direct_script: Mutex<Vec<WireResponse>>,
    creates: AtomicU32,
    patches: AtomicU32,
    probes: AtomicU32,
    directs: AtomicU32,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState::default()),
            patch_faults: Mutex::new(HashMap::new()),
            create_script: Mutex::new(Vec::new()),
            direct_script: Mutex::new(Vec::new()),
            creates: AtomicU32::new(0),
            patches: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            directs: AtomicU32::new(0),
        })
    }

    fn fault_patch(&self, request_index: u32, fault: PatchFault) {
        self.patch_faults
            .lock()
            .expect("lock")
            .insert(request_index, fault);
    }

    fn script_create(&self, response: WireResponse) {
        self.create_script.lock().expect("lock").push(response);
    }

    fn script_direct(&self, response: WireResponse) {
        self.direct_script.lock().expect("lock").push(response);
    }

    fn received(&self) -> Vec<u8> {
        self.state.lock().expect("lock").received.clone()
    }

    fn acked_offsets(&self) -> Vec<u64> {
        self.state.lock().expect("lock").acked_offsets.clone()
    }

    fn counts(&self) -> (u32, u32, u32, u32) {
        (
            self.creates.load(Ordering::SeqCst),
            self.patches.load(Ordering::SeqCst),
            self.probes.load(Ordering::SeqCst),
            self.directs.load(Ordering::SeqCst),
        )
    }

    fn apply(state: &mut BackendState, body: &Bytes) {
        state.received.extend_from_slice(body);
        state.offset += body.len() as u64;
        state.acked_offsets.push(state.offset);
    }
}

#[async_trait]
impl UploadTransport for FakeBackend {
    async fn open_session(
        &self,
        request: &SessionRequest,
    ) -> Result<WireResponse, TransportError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(scripted) = self.create_script.lock().expect("lock").pop() {
            return Ok(scripted);
        }
        // A new session discards whatever the previous one received.
        let mut state = self.state.lock().expect("lock");
        *state = BackendState {
            total_len: request.total_len,
            ..BackendState::default()
        };
        Ok(WireResponse {
            status: 201,
            location: Some(format!("https://media.example/api/uploads/s{n}")),
            ..Default::default()
        })
    }

    async fn send_chunk(
        &self,
        _session_uri: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<WireResponse, TransportError> {
        let index = self.patches.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self.patch_faults.lock().expect("lock").remove(&index);
        let mut state = self.state.lock().expect("lock");

        match fault {
            Some(PatchFault::Reject(status)) => {
                let body = if status == 404 { "upload not found" } else { "backend hiccup" };
                return Ok(WireResponse {
                    status,
                    body: body.to_string(),
                    ..Default::default()
                });
            }
            Some(PatchFault::RejectBody(status, body)) => {
                return Ok(WireResponse {
                    status,
                    body: body.to_string(),
                    ..Default::default()
                });
            }
            Some(PatchFault::ApplyThenReject(status)) => {
                Self::apply(&mut state, &body);
                return Ok(WireResponse {
                    status,
                    body: "ack lost on the way back".to_string(),
                    ..Default::default()
                });
            }
            None => {}
        }

        if offset != state.offset {
            return Ok(WireResponse {
                status: 409,
                offset: Some(state.offset),
                ..Default::default()
            });
        }

        Self::apply(&mut state, &body);
        let artifact = (state.offset == state.total_len).then(|| "media-789".to_string());
        Ok(WireResponse {
            status: 204,
            offset: Some(state.offset),
            artifact,
            ..Default::default()
        })
    }

    async fn probe(&self, _session_uri: &str) -> Result<WireResponse, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("lock");
        Ok(WireResponse {
            status: 200,
            offset: Some(state.offset),
            ..Default::default()
        })
    }

    async fn submit_direct(
        &self,
        submission: DirectSubmission,
    ) -> Result<WireResponse, TransportError> {
        self.directs.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.direct_script.lock().expect("lock").pop() {
            return Ok(scripted);
        }
        let mut state = self.state.lock().expect("lock");
        state.received = submission.data.to_vec();
        Ok(WireResponse {
            status: 200,
            body: r#"{"media": {"id": "media-123"}}"#.to_string(),
            ..Default::default()
        })
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_fraction: 0.0,
    }
}

fn options() -> UploadOptions {
    UploadOptions {
        file_name: "episode-05.mp3".to_string(),
        mime_type: "audio/mpeg".to_string(),
        language: "en".to_string(),
        classification: "podcast".to_string(),
        title: Some("Episode 5".to_string()),
    }
}

fn uploader_over(backend: Arc<FakeBackend>, relay_root: &Path) -> Uploader {
    let resolver = SourceResolver::with_roots(relay_root.to_path_buf(), None, None);
    Uploader::with_transport(backend, resolver)
        .retry_policy(fast_policy())
        .chunk_size(CHUNK)
        .direct_threshold(DIRECT_MAX)
}

async fn write_source(dir: &Path, name: &str, len: usize) -> (String, Vec<u8>) {
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    tokio::fs::write(&path, &bytes).await.expect("write source");
    (path.to_str().expect("utf-8 path").to_string(), bytes)
}

// Scenario A: a small file goes out as exactly one multipart submission.
#[tokio::test]
async fn small_file_uses_single_multipart_submission() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "short.mp3", 1500).await;

    let uploaded = uploader.upload(&reference, options()).await.expect("upload");
    assert_eq!(uploaded.artifact.as_deref(), Some("media-123"));

    let (creates, patches, probes, directs) = backend.counts();
    assert_eq!((creates, patches, probes, directs), (0, 0, 0, 1));
    assert_eq!(backend.received(), bytes);
    // The consumed relay source is gone after success.
    assert!(!Path::new(&reference).exists());
}

// Scenario B: one transient failure on chunk 3 costs exactly one extra
// transfer request and no probes.
#[tokio::test]
async fn transient_chunk_failure_retries_once() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(3, PatchFault::Reject(500));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "album.flac", 10 * CHUNK).await;

    let uploaded = uploader.upload(&reference, options()).await.expect("upload");
    assert_eq!(uploaded.artifact.as_deref(), Some("media-789"));

    let (creates, patches, probes, _) = backend.counts();
    assert_eq!(creates, 1);
    assert_eq!(patches, 11, "10 chunks + 1 retried");
    assert_eq!(probes, 0, "the first retry resends without probing");

    // The server saw every byte exactly once, in order.
    assert_eq!(backend.received(), bytes);
    let acked = backend.acked_offsets();
    assert!(acked.windows(2).all(|w| w[0] < w[1]), "offsets must grow");
    assert_eq!(acked.last().copied(), Some(bytes.len() as u64));
}

// Scenario C: an expired session triggers exactly one full restart from
// offset 0 under a brand-new session.
#[tokio::test]
async fn expired_session_restarts_from_zero() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(5, PatchFault::Reject(404));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "film.mkv", 10 * CHUNK).await;

    let uploaded = uploader.upload(&reference, options()).await.expect("upload");
    assert_eq!(uploaded.artifact.as_deref(), Some("media-789"));

    let (creates, patches, _, _) = backend.counts();
    assert_eq!(creates, 2, "one restart opens one new session");
    // 4 accepted + 1 expired in session one, all 10 again in session two.
    assert_eq!(patches, 15);
    assert_eq!(backend.received(), bytes, "second session carries the whole file");
}

// Expiry on the final chunk: the full file is still retransmitted, since
// the protocol cannot resume a lost session.
#[tokio::test]
async fn expiry_on_final_chunk_retransmits_everything() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(10, PatchFault::Reject(404));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "long.wav", 10 * CHUNK).await;

    uploader.upload(&reference, options()).await.expect("upload");
    let (creates, patches, _, _) = backend.counts();
    assert_eq!(creates, 2);
    assert_eq!(patches, 20);
    assert_eq!(backend.received(), bytes);
}

// Scenario D: a rate-limited handshake is terminal before any chunk moves.
#[tokio::test]
async fn rate_limited_handshake_sends_no_chunks() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.script_create(WireResponse {
        status: 429,
        body: "too many uploads".to_string(),
        ..Default::default()
    });
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, _) = write_source(relay.path(), "big.mov", 10 * CHUNK).await;

    let err = uploader.upload(&reference, options()).await.expect_err("must fail");
    assert!(err.is_rate_limited());
    assert_eq!(err.code(), "rate_limited");
    assert!(err.is_retryable());

    let (creates, patches, probes, directs) = backend.counts();
    assert_eq!((creates, patches, probes, directs), (1, 0, 0, 0));
    // Nothing is deleted on failure.
    assert!(Path::new(&reference).exists());
}

// Boundary: at the threshold the simple path is used, one byte over flips
// to the chunked path.
#[tokio::test]
async fn threshold_boundary_picks_the_path() {
    let relay = tempfile::tempdir().expect("tempdir");

    let backend = FakeBackend::new();
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, _) = write_source(relay.path(), "exact.bin", DIRECT_MAX as usize).await;
    uploader.upload(&reference, options()).await.expect("upload");
    let (creates, _, _, directs) = backend.counts();
    assert_eq!((creates, directs), (0, 1), "at the threshold: simple path");

    let backend = FakeBackend::new();
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "over.bin", DIRECT_MAX as usize + 1).await;
    uploader.upload(&reference, options()).await.expect("upload");
    let (creates, patches, _, directs) = backend.counts();
    assert_eq!((creates, directs), (1, 0), "one byte over: chunked path");
    assert_eq!(patches, 3, "1024 + 1024 + 1 trailing byte");
    assert_eq!(backend.received(), bytes);
}

// A lost acknowledgement must not duplicate data: the server answers the
// blind resend with a conflict, the engine adopts the corrected offset.
#[tokio::test]
async fn lost_ack_reconciles_via_conflict() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(1, PatchFault::ApplyThenReject(500));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "clip.mp4", 3 * CHUNK).await;

    uploader.upload(&reference, options()).await.expect("upload");
    assert_eq!(backend.received(), bytes, "no byte duplicated or lost");

    let (_, patches, _, _) = backend.counts();
    // applied-but-lost + conflicted blind resend + the two remaining
    // chunks, resumed past the already-applied first one
    assert_eq!(patches, 4);
}

// Two lost/failed attempts in a row: the second retry probes first and
// resumes from the authoritative offset instead of resending blind.
#[tokio::test]
async fn second_retry_probes_before_resending() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(1, PatchFault::ApplyThenReject(500));
    backend.fault_patch(2, PatchFault::Reject(502));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "take2.mp4", 3 * CHUNK).await;

    uploader.upload(&reference, options()).await.expect("upload");
    assert_eq!(backend.received(), bytes);

    let (_, patches, probes, _) = backend.counts();
    assert_eq!(probes, 1, "attempt three probes for the offset");
    // lost ack + rejected blind resend + the two remaining chunks (the
    // probe moved the offset past the already-applied first one)
    assert_eq!(patches, 4);
}

// Exhausting the per-chunk budget surfaces the last observed error.
#[tokio::test]
async fn retry_budget_exhaustion_is_terminal() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    for index in 1..=5 {
        backend.fault_patch(index, PatchFault::Reject(503));
    }
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, _) = write_source(relay.path(), "doomed.bin", 3 * CHUNK).await;

    let err = uploader.upload(&reference, options()).await.expect_err("must fail");
    match err {
        UploadError::ChunkFailed { offset, attempts, ref message, .. } => {
            assert_eq!(offset, 0);
            assert_eq!(attempts, 5);
            assert!(message.contains("503"), "last error kept: {message}");
        }
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());

    let (_, patches, probes, _) = backend.counts();
    assert_eq!(patches, 5);
    assert_eq!(probes, 3, "attempts 3..=5 probe before resending");
    assert!(Path::new(&reference).exists(), "failed uploads keep the source");
}

// Session loss on every attempt: one restart per expiry, then a terminal
// session-lost error once the bound is exceeded.
#[tokio::test]
async fn restart_bound_caps_session_recovery() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    for index in 1..=4 {
        backend.fault_patch(index, PatchFault::Reject(404));
    }
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, _) = write_source(relay.path(), "cursed.bin", 3 * CHUNK).await;

    let err = uploader.upload(&reference, options()).await.expect_err("must fail");
    match err {
        UploadError::SessionLost { restarts } => assert_eq!(restarts, 3),
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), "session_lost");

    let (creates, patches, _, _) = backend.counts();
    assert_eq!(creates, 4, "initial session + 3 restarts");
    assert_eq!(patches, 4, "each session dies on its first chunk");
}

// A body-phrase expiry (not a 404) is treated the same as a missing
// session: restart, not local retry.
#[tokio::test]
async fn phrase_expiry_triggers_restart() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.fault_patch(2, PatchFault::RejectBody(410, "the session has expired"));
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, bytes) = write_source(relay.path(), "gone.bin", 3 * CHUNK).await;

    uploader.upload(&reference, options()).await.expect("upload");
    let (creates, patches, probes, _) = backend.counts();
    assert_eq!(creates, 2);
    assert_eq!(probes, 0, "expiry aborts without draining the retry budget");
    // 1 accepted + 1 expired in session one, 3 in session two
    assert_eq!(patches, 5);
    assert_eq!(backend.received(), bytes);
}

// Scenario E: a relay reference that is unreadable directly and has no
// mounted remap resolves via the extraction command; the temp copy is
// deleted after success.
#[tokio::test]
async fn extraction_temp_copy_is_deleted_after_success() {
    let scripts = tempfile::tempdir().expect("tempdir");
    let script = scripts.path().join("relay-extract");
    let record = scripts.path().join("last-dst");
    let body = format!(
        "#!/bin/sh\nprintf 'relayed media bytes' > \"$2\"\nprintf '%s' \"$2\" > {}\n",
        record.display()
    );
    tokio::fs::write(&script, body).await.expect("write script");
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");
    }

    let backend = FakeBackend::new();
    let resolver = SourceResolver::with_roots(
        "/srv/relay-storage".into(),
        Some("/srv/relay-mount-missing".into()),
        Some(format!("{} {{src}} {{dst}}", script.display())),
    );
    let uploader = Uploader::with_transport(backend.clone(), resolver)
        .retry_policy(fast_policy())
        .chunk_size(CHUNK)
        .direct_threshold(DIRECT_MAX);

    let uploaded = uploader
        .upload("/srv/relay-storage/audio/e5.mp3", options())
        .await
        .expect("upload");
    assert_eq!(uploaded.artifact.as_deref(), Some("media-123"));

    let temp_path = tokio::fs::read_to_string(&record).await.expect("recorded dst");
    assert!(!temp_path.is_empty());
    assert!(
        !Path::new(temp_path.trim()).exists(),
        "temp copy must be deleted after success"
    );
    assert_eq!(backend.received(), b"relayed media bytes");
}

// Progress events report server-acknowledged bytes after every chunk.
#[tokio::test]
async fn progress_reports_acknowledged_bytes() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let uploader = uploader_over(backend, relay.path()).progress_channel(tx);
    let (reference, _) = write_source(relay.path(), "steady.bin", 3 * CHUNK).await;

    uploader.upload(&reference, options()).await.expect("upload");

    let mut seen = Vec::new();
    while let Ok(update) = rx.try_recv() {
        assert_eq!(update.total_len, 3 * CHUNK as u64);
        seen.push(update.bytes_acknowledged);
    }
    assert_eq!(seen, vec![CHUNK as u64, 2 * CHUNK as u64, 3 * CHUNK as u64]);
}

// A rejected direct submission parses the structured error envelope and
// deletes nothing.
#[tokio::test]
async fn rejected_direct_submission_keeps_files() {
    let relay = tempfile::tempdir().expect("tempdir");
    let backend = FakeBackend::new();
    backend.script_direct(WireResponse {
        status: 507,
        body: r#"{"code": "quota_exceeded", "message": "library is full"}"#.to_string(),
        ..Default::default()
    });
    let uploader = uploader_over(backend.clone(), relay.path());
    let (reference, _) = write_source(relay.path(), "small.mp3", 512).await;

    let err = uploader.upload(&reference, options()).await.expect_err("must fail");
    match err {
        UploadError::Rejected { rate_limited, ref message } => {
            assert!(!rate_limited);
            assert!(message.contains("quota_exceeded"));
            assert!(message.contains("library is full"));
        }
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert!(Path::new(&reference).exists());
}

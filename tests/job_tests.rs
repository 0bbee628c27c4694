//! Audio job pipeline: validation, lazy engine loading and transcoding.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tempfile::TempDir;

use gen_serve::audio::{AudioFormat, MediaTranscoder, TranscodeError};
use gen_serve::config::TranscoderConfig;
use gen_serve::inference::audio::{
    AudioEngine, AudioOutput, AudioParams, LazyAudioEngine, Samples, INSTRUMENTAL_MARKER,
};
use gen_serve::inference::engine::EngineError;
use gen_serve::job::{JobRequestHandler, JobResult};

/// Counts invocations and remembers the last parameters.
#[derive(Default)]
struct CountingEngine {
    calls: AtomicUsize,
    last: std::sync::Mutex<Option<AudioParams>>,
}

impl AudioEngine for CountingEngine {
    fn invoke(&self, params: &AudioParams) -> Result<AudioOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(params.clone());
        Ok(AudioOutput {
            samples: Samples::Multi(vec![vec![0.5; 800], vec![-0.5; 800]]),
            sample_rate: 8_000,
        })
    }
}

struct Harness {
    handler: JobRequestHandler,
    engine: Arc<CountingEngine>,
    loads: Arc<AtomicUsize>,
    scratch: TempDir,
}

fn harness(ffmpeg_path: PathBuf, timeout_secs: f64) -> Harness {
    let engine = Arc::new(CountingEngine::default());
    let loads = Arc::new(AtomicUsize::new(0));

    let loader_engine = engine.clone();
    let loader_loads = loads.clone();
    let lazy = LazyAudioEngine::new(Arc::new(
        move || -> Result<Arc<dyn AudioEngine>, EngineError> {
            loader_loads.fetch_add(1, Ordering::SeqCst);
            Ok(loader_engine.clone())
        },
    ));

    let scratch = tempfile::tempdir().unwrap();
    let transcoder = MediaTranscoder::new(TranscoderConfig {
        ffmpeg_path,
        timeout_secs,
        scratch_dir: Some(scratch.path().to_path_buf()),
        ..Default::default()
    });

    Harness {
        handler: JobRequestHandler::new(Arc::new(lazy), transcoder),
        engine,
        loads,
        scratch,
    }
}

fn wav_harness() -> Harness {
    harness("/nonexistent/ffmpeg".into(), 30.0)
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

/// Fake encoders, written once before any test spawns a process so no
/// script is executed while another thread still holds it open for writing.
struct FakeEncoders {
    _dir: TempDir,
    copy: PathBuf,
    hang: PathBuf,
    fail: PathBuf,
}

#[cfg(unix)]
fn fake_encoders() -> &'static FakeEncoders {
    use std::os::unix::fs::PermissionsExt;

    static ENCODERS: OnceLock<FakeEncoders> = OnceLock::new();
    ENCODERS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        // Copies the `-i` input to the last argument.
        let copy = write(
            "copy-encoder",
            r#"prev=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then src="$arg"; fi
  prev="$arg"
done
cp "$src" "$prev""#,
        );
        let hang = write("hang-encoder", "exec sleep 5");
        let fail = write("fail-encoder", "echo 'unknown codec' >&2\nexit 3");

        FakeEncoders {
            _dir: dir,
            copy,
            hang,
            fail,
        }
    })
}

#[tokio::test]
async fn test_ping_never_loads_engine() {
    let h = wav_harness();

    for input in [json!({"prompt": "__ping__"}), json!({"prompt": "  __ping__ ", "duration": "junk"})] {
        assert_eq!(h.handler.handle(&input).await, JobResult::alive());
    }

    assert_eq!(h.loads.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_prompt_rejected_without_engine_work() {
    let h = wav_harness();

    for input in [json!({}), json!({"prompt": ""}), json!({"prompt": "   "}), json!({"prompt": 7}), json!("text")] {
        let result = h.handler.handle(&input).await;
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"error": "prompt is required"})
        );
    }

    assert_eq!(h.loads.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_duration_clamped() {
    let h = wav_harness();

    for (requested, expected) in [(json!(300), 240.0), (json!(1), 5.0), (json!("30"), 30.0)] {
        let result = h
            .handler
            .handle(&json!({"prompt": "lofi", "duration": requested, "format": "wav"}))
            .await;
        match result {
            JobResult::Success { duration, .. } => assert_eq!(duration, expected),
            other => panic!("unexpected result: {other:?}"),
        }
        let params = h.engine.last.lock().unwrap().clone().unwrap();
        assert_eq!(params.duration, expected);
    }

    // Loaded once, reused afterwards.
    assert_eq!(h.loads.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unsupported_format_degrades_to_wav() {
    let h = wav_harness();

    let result = h
        .handler
        .handle(&json!({"prompt": "ambient", "format": "flac"}))
        .await;

    let JobResult::Success {
        audio_base64,
        format,
        sample_rate,
        ..
    } = result
    else {
        panic!("expected success");
    };
    assert_eq!(format, AudioFormat::Wav);
    assert_eq!(sample_rate, 8_000);

    let bytes = BASE64.decode(audio_base64).unwrap();
    assert_eq!(&bytes[..4], b"RIFF");
    // 800 mono 16-bit frames
    assert_eq!(bytes.len(), 44 + 800 * 2);
    assert!(scratch_is_empty(h.scratch.path()));
}

#[tokio::test]
async fn test_lyrics_follow_instrumental_flag() {
    let h = wav_harness();

    h.handler
        .handle(&json!({"prompt": "p", "lyrics": "la la", "format": "wav"}))
        .await;
    let params = h.engine.last.lock().unwrap().clone().unwrap();
    assert_eq!(params.lyrics, INSTRUMENTAL_MARKER);

    h.handler
        .handle(&json!({"prompt": "p", "lyrics": "la la", "instrumental": false, "format": "wav"}))
        .await;
    let params = h.engine.last.lock().unwrap().clone().unwrap();
    assert_eq!(params.lyrics, "la la");
}

#[cfg(unix)]
#[tokio::test]
async fn test_compressed_format_uses_encoder() {
    let h = harness(fake_encoders().copy.clone(), 10.0);

    let result = h
        .handler
        .handle(&json!({"prompt": "city pop", "duration": 10}))
        .await;

    let JobResult::Success {
        audio_base64,
        format,
        duration,
        ..
    } = result
    else {
        panic!("expected success");
    };
    assert_eq!(format, AudioFormat::Mp3);
    assert_eq!(duration, 10.0);
    // The fake encoder copies its input, so the payload is the WAV baseline.
    assert_eq!(&BASE64.decode(audio_base64).unwrap()[..4], b"RIFF");
    assert!(scratch_is_empty(h.scratch.path()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_encoder_timeout_reported_and_cleaned_up() {
    let h = harness(fake_encoders().hang.clone(), 0.2);

    let started = std::time::Instant::now();
    let result = h
        .handler
        .handle(&json!({"prompt": "drone", "format": "ogg"}))
        .await;
    assert!(started.elapsed() < std::time::Duration::from_secs(4));

    let JobResult::Failure { error, traceback } = result else {
        panic!("expected failure");
    };
    assert!(error.starts_with("transcoding to ogg: Encoder did not finish within"), "{error}");
    assert!(traceback.is_some());
    assert!(scratch_is_empty(h.scratch.path()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_encoder_failure_carries_stderr() {
    let h = harness(fake_encoders().fail.clone(), 10.0);

    let result = h.handler.handle(&json!({"prompt": "noise"})).await;
    let JobResult::Failure { error, .. } = result else {
        panic!("expected failure");
    };
    assert!(error.contains("unknown codec"), "{error}");
    assert!(scratch_is_empty(h.scratch.path()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_transcoder_errors_are_typed() {
    let scratch = tempfile::tempdir().unwrap();
    let transcoder = MediaTranscoder::new(TranscoderConfig {
        ffmpeg_path: fake_encoders().fail.clone(),
        scratch_dir: Some(scratch.path().to_path_buf()),
        ..Default::default()
    });

    let err = transcoder
        .transcode(vec![0.0; 64], 8_000, AudioFormat::Mp3)
        .await
        .unwrap_err();
    match err {
        TranscodeError::EncoderFailed { status, stderr } => {
            assert_eq!(status.code(), Some(3));
            assert_eq!(stderr, "unknown codec");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(scratch_is_empty(scratch.path()));
}

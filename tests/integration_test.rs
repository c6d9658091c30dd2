use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use serde_json::{json, Value};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use text2audio::api::{router, AppState};
use text2audio::backends::gtts::CloudTts;
use text2audio::backends::piper::PiperAdapter;
use text2audio::backends::{DriverEvent, SpeechDriver, Voice};
use text2audio::engine::OfflineEngine;
use text2audio::model_repo::ModelRepository;
use text2audio::Synthesizer;
use tower::ServiceExt;

mockall::mock! {
    pub Driver {}
    impl SpeechDriver for Driver {
        fn id(&self) -> &'static str;
        fn list_voices(&mut self) -> io::Result<Vec<Voice>>;
        fn set_voice(&mut self, voice_id: &str);
        fn save_to_file(&mut self, text: &str, out: &Path) -> io::Result<()>;
        fn start_loop(&mut self) -> io::Result<()>;
        fn iterate(&mut self) -> io::Result<Vec<DriverEvent>>;
        fn end_loop(&mut self);
        fn stop(&mut self);
    }
}

/// Writes a small WAV header on the first pump and reports completion.
struct InstantDriver {
    pending: Option<PathBuf>,
}

impl SpeechDriver for InstantDriver {
    fn id(&self) -> &'static str {
        "instant"
    }
    fn list_voices(&mut self) -> io::Result<Vec<Voice>> {
        Ok(Vec::new())
    }
    fn set_voice(&mut self, _voice_id: &str) {}
    fn save_to_file(&mut self, _text: &str, out: &Path) -> io::Result<()> {
        self.pending = Some(out.to_path_buf());
        Ok(())
    }
    fn start_loop(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn iterate(&mut self) -> io::Result<Vec<DriverEvent>> {
        if let Some(out) = self.pending.take() {
            std::fs::write(out, b"RIFF....WAVEfmt ")?;
        }
        Ok(vec![DriverEvent::FinishedUtterance { completed: true }])
    }
    fn end_loop(&mut self) {}
    fn stop(&mut self) {}
}

fn test_synthesizer(models_dir: &Path) -> Synthesizer {
    Synthesizer::new(
        CloudTts::new("http://127.0.0.1:9/translate_tts"),
        Box::new(|| -> Box<dyn SpeechDriver> { Box::new(InstantDriver { pending: None }) }),
        PiperAdapter::new(
            ModelRepository::new(models_dir, "http://127.0.0.1:9"),
            Vec::new(),
        ),
    )
}

fn app(dir: &Path) -> axum::Router {
    router(AppState::new(test_synthesizer(&dir.join("models")), dir.join("data")))
}

async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn post_json(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, bytes) = send(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

#[test]
fn test_engine_drives_mocked_driver() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("hello.wav");

    let mut driver = MockDriver::new();
    driver.expect_id().return_const("mock");
    driver.expect_list_voices().times(1).returning(|| {
        Ok(vec![
            Voice {
                id: "gmw/en".into(),
                name: "English".into(),
                languages: vec!["en".into()],
            },
            Voice {
                id: "gmw/de".into(),
                name: "German".into(),
                languages: vec!["de".into()],
            },
        ])
    });
    driver
        .expect_set_voice()
        .with(mockall::predicate::eq("gmw/de"))
        .times(1)
        .return_const(());
    driver
        .expect_save_to_file()
        .times(1)
        .returning(|_, out| std::fs::write(out, b"RIFF....WAVE"));
    driver.expect_start_loop().times(1).returning(|| Ok(()));
    driver
        .expect_iterate()
        .returning(|| Ok(vec![DriverEvent::FinishedUtterance { completed: true }]));
    driver.expect_end_loop().times(1).return_const(());
    // once by the loop guard, once when the engine is dropped
    driver.expect_stop().times(2).return_const(());

    let engine = OfflineEngine::new(Box::new(driver));
    let path = engine.synthesize_to_wav("Hallo Welt", &out, Some("DE")).unwrap();
    assert_eq!(path, out);
    drop(engine);
}

#[test]
fn test_engine_stops_driver_when_iterate_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = MockDriver::new();
    driver.expect_id().return_const("mock");
    driver.expect_save_to_file().returning(|_, _| Ok(()));
    driver.expect_start_loop().returning(|| Ok(()));
    driver
        .expect_iterate()
        .times(1)
        .returning(|| Err(io::Error::new(io::ErrorKind::BrokenPipe, "driver died")));
    driver.expect_end_loop().times(1).return_const(());
    driver.expect_stop().times(2).return_const(());

    let engine = OfflineEngine::new(Box::new(driver));
    let err = engine
        .synthesize_to_wav("hello", &dir.path().join("x.wav"), None)
        .unwrap_err();
    assert!(matches!(err, text2audio::TtsError::Io(_)));
}

#[tokio::test]
async fn test_health_and_models() {
    let dir = tempfile::tempdir().unwrap();

    let (status, body) = get(app(dir.path()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"status": "ok"}));

    let (status, body) = get(app(dir.path()), "/api/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap(),
        json!({"models": ["Amy (US)", "Karlsson (DE)", "Libri (US)", "Thorsten (DE)"]})
    );
}

#[tokio::test]
async fn test_index_page_is_served() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = get(app(dir.path()), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("/api/synthesize"));
}

#[tokio::test]
async fn test_synthesize_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
        json!({"text": "   "}),
        json!({"text": "hi", "backend": "piper"}),
        json!({"text": "hi", "backend": "festival"}),
        json!({"text": "hi", "chunk_size": 100}),
        json!({"text": "hi", "chunk_size": 9000}),
        json!({"text": "hi", "filename": "../escape.wav"}),
        json!({"backend": "gtts"}),
    ];
    for case in cases {
        let (status, body) = post_json(app(dir.path()), "/api/synthesize", case.clone()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}", case);
        assert!(body["detail"].is_string(), "{}", case);
    }
}

#[tokio::test]
async fn test_malformed_json_is_unprocessable() {
    let dir = tempfile::tempdir().unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/api/synthesize")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(app(dir.path()), req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(serde_json::from_slice::<Value>(&body).unwrap()["detail"].is_string());
}

#[tokio::test]
async fn test_synthesize_single_file_and_download() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = post_json(
        app(dir.path()),
        "/api/synthesize",
        json!({"text": "Hello there", "backend": "pyttsx3"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let output = PathBuf::from(body["output"].as_str().unwrap());
    assert_eq!(output, dir.path().join("data/speech.wav"));
    assert!(output.is_file());

    let (status, bytes) = get(app(dir.path()), "/api/files/speech.wav").await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.starts_with(b"RIFF"));

    let (status, _) = get(app(dir.path()), "/api/files/missing.wav").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_filename_extension_follows_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = post_json(
        app(dir.path()),
        "/api/synthesize",
        json!({"text": "Hello", "backend": "pyttsx3", "filename": "talk.mp3"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["output"].as_str().unwrap().ends_with("talk.wav"));
}

#[tokio::test]
async fn test_chunked_synthesis_returns_zip() {
    let dir = tempfile::tempdir().unwrap();
    let text = "abcdefghij".repeat(45);
    let (status, body) = post_json(
        app(dir.path()),
        "/api/synthesize",
        json!({
            "text": text,
            "backend": "pyttsx3",
            "filename": "book.wav",
            "chunking": true,
            "chunk_size": 200
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Saved 3 chunks and ZIP.");

    let outputs: Vec<&str> = body["outputs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(outputs.len(), 3);
    for (i, out) in outputs.iter().enumerate() {
        assert!(out.ends_with(&format!("book_{}.wav", i + 1)));
    }

    let zip_path = PathBuf::from(body["zip"].as_str().unwrap());
    assert_eq!(zip_path, dir.path().join("data/book.zip"));
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&zip_path).unwrap()).unwrap();
    assert_eq!(archive.len(), 3);
    let mut first = Vec::new();
    archive
        .by_name("book_1.wav")
        .unwrap()
        .read_to_end(&mut first)
        .unwrap();
    assert!(first.starts_with(b"RIFF"));
}

#[tokio::test]
async fn test_short_text_is_not_chunked() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = post_json(
        app(dir.path()),
        "/api/synthesize",
        json!({"text": "short", "backend": "pyttsx3", "chunking": true, "chunk_size": 200}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("output").is_some());
    assert!(body.get("zip").is_none());
}

#[tokio::test]
async fn test_synthesis_failure_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = post_json(
        app(dir.path()),
        "/api/synthesize",
        json!({"text": "hi", "backend": "piper", "piper_model": "/nonexistent/voice.onnx"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Synthesis failed: "));
}

#[tokio::test]
async fn test_extract_text_upload() {
    let dir = tempfile::tempdir().unwrap();
    let data = base64::engine::general_purpose::STANDARD.encode("Guten Tag".as_bytes());
    let (status, body) = post_json(
        app(dir.path()),
        "/api/extract",
        json!({"filename": "greeting.txt", "data": data}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"text": "Guten Tag", "characters": 9}));

    let (status, body) = post_json(
        app(dir.path()),
        "/api/extract",
        json!({"filename": "slides.pptx", "data": data}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("Unsupported file type"));

    let (status, _) = post_json(
        app(dir.path()),
        "/api/extract",
        json!({"filename": "a.txt", "data": "***"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

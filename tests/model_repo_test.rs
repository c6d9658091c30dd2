use flate2::write::GzEncoder;
use flate2::Compression;
use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use text2audio::backends::piper::{PiperAdapter, PiperParams, ResolvedModel, SynthesisStrategy};
use text2audio::model_repo::ModelRepository;
use text2audio::TtsError;

const AMY_DIR: &str = "/en/en_US/amy/medium";
const MIN_SIZE: u64 = 1024;

fn model_bytes() -> Vec<u8> {
    // protobuf-ish leading bytes, large enough to pass the size check
    let mut bytes = vec![0x08, 0x07, 0x12, 0x04];
    bytes.resize(4096, 0x2a);
    bytes
}

/// File names currently in the models directory, sorted.
fn model_dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join("models"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn repo(server: &mockito::Server, dir: &Path) -> ModelRepository {
    ModelRepository::new(dir.join("models"), server.url()).with_min_model_size(MIN_SIZE)
}

#[test]
fn test_downloads_model_and_sidecar_once() {
    let mut server = mockito::Server::new();
    let onnx = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(200)
        .with_body(model_bytes())
        .expect(1)
        .create();
    let json = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx.json", AMY_DIR).as_str())
        .with_status(200)
        .with_body(r#"{"audio":{"sample_rate":22050}}"#)
        .expect(1)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let repo = repo(&server, dir.path());
    let (model, config) = repo.ensure_model("Amy (US)").unwrap();
    assert_eq!(std::fs::read(&model).unwrap(), model_bytes());
    assert!(config.is_file());
    assert_eq!(model_dir_entries(dir.path()).len(), 2);

    // already present: nothing is fetched again
    let again = repo.ensure_model("Amy (US)").unwrap();
    assert_eq!(again, (model, config));

    onnx.assert();
    json.assert();
}

#[test]
fn test_falls_back_to_gzip_variant() {
    let mut server = mockito::Server::new();
    let _plain = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(404)
        .create();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&model_bytes()).unwrap();
    let gz = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx.gz", AMY_DIR).as_str())
        .with_status(200)
        .with_body(encoder.finish().unwrap())
        .expect(1)
        .create();
    let _json = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx.json", AMY_DIR).as_str())
        .with_status(200)
        .with_body("{}")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let (model, _) = repo(&server, dir.path()).ensure_model("Amy (US)").unwrap();
    assert_eq!(std::fs::read(&model).unwrap(), model_bytes());
    assert_eq!(
        model_dir_entries(dir.path()),
        vec!["en_US-amy-medium.onnx", "en_US-amy-medium.onnx.json"]
    );
    gz.assert();
}

#[test]
fn test_missing_everywhere_is_download_error() {
    let mut server = mockito::Server::new();
    let _any = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(404)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let err = repo(&server, dir.path())
        .ensure_model("Karlsson (DE)")
        .unwrap_err();
    assert!(matches!(err, TtsError::Download { .. }));
}

#[test]
fn test_html_placeholder_is_rejected_and_removed() {
    let mut server = mockito::Server::new();
    let mut page = b"<!DOCTYPE html><html><body>Sign in</body></html>".to_vec();
    page.resize(4096, b' ');
    let _onnx = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(200)
        .with_body(page)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let err = repo(&server, dir.path()).ensure_model("Amy (US)").unwrap_err();
    match err {
        TtsError::InvalidModelArtifact { path, .. } => {
            assert_eq!(path, dir.path().join("models/en_US-amy-medium.onnx"))
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(model_dir_entries(dir.path()).is_empty());
}

#[test]
fn test_too_small_download_is_rejected_and_removed() {
    let mut server = mockito::Server::new();
    let _onnx = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(200)
        .with_body(vec![0x08; 100])
        .create();

    let dir = tempfile::tempdir().unwrap();
    let err = repo(&server, dir.path()).ensure_model("Amy (US)").unwrap_err();
    assert!(err.to_string().contains("too small"));
    assert!(model_dir_entries(dir.path()).is_empty());
}

#[test]
fn test_concurrent_first_use_downloads_once() {
    let mut server = mockito::Server::new();
    let onnx = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(200)
        .with_chunked_body(|w| {
            for piece in model_bytes().chunks(256) {
                w.write_all(piece)?;
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(())
        })
        .expect(1)
        .create();
    let json = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx.json", AMY_DIR).as_str())
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let repo = repo(&server, dir.path());
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| repo.ensure_model("Amy (US)")))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in results {
        let (model, _) = result.unwrap();
        assert_eq!(std::fs::read(&model).unwrap(), model_bytes());
    }
    assert_eq!(
        model_dir_entries(dir.path()),
        vec!["en_US-amy-medium.onnx", "en_US-amy-medium.onnx.json"]
    );
    onnx.assert();
    json.assert();
}

#[test]
fn test_progress_reaches_one() {
    let mut server = mockito::Server::new();
    let _onnx = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx", AMY_DIR).as_str())
        .with_status(200)
        .with_body(model_bytes())
        .create();
    let _json = server
        .mock("GET", format!("{}/en_US-amy-medium.onnx.json", AMY_DIR).as_str())
        .with_status(200)
        .with_body("{}")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let seen: RefCell<Vec<(String, f32)>> = RefCell::new(Vec::new());
    repo(&server, dir.path())
        .ensure_model_with_progress("Amy (US)", &|label: &str, frac: f32| {
            seen.borrow_mut().push((label.to_string(), frac))
        })
        .unwrap();

    let seen = seen.into_inner();
    assert!(seen.iter().all(|(_, f)| (0.0..=1.0).contains(f)));
    assert!(seen
        .iter()
        .any(|(label, f)| label == "en_US-amy-medium.onnx" && *f == 1.0));
    assert_eq!(seen.last().map(|(_, f)| *f), Some(1.0));
}

struct CopyStrategy;

impl SynthesisStrategy for CopyStrategy {
    fn name(&self) -> &str {
        "copy"
    }

    fn synthesize(
        &self,
        text: &str,
        model: &ResolvedModel,
        out: &Path,
        _params: &PiperParams,
    ) -> text2audio::Result<()> {
        assert!(model.config.is_file());
        std::fs::write(out, format!("RIFF{}", text))?;
        Ok(())
    }
}

#[test]
fn test_piper_key_downloads_on_first_use() {
    let mut server = mockito::Server::new();
    let onnx = server
        .mock("GET", "/de/de_DE/thorsten/high/de_DE-thorsten-high.onnx")
        .with_status(200)
        .with_body(model_bytes())
        .expect(1)
        .create();
    let _json = server
        .mock("GET", "/de/de_DE/thorsten/high/de_DE-thorsten-high.onnx.json")
        .with_status(200)
        .with_body("{}")
        .create();

    let dir = tempfile::tempdir().unwrap();
    let adapter = PiperAdapter::new(repo(&server, dir.path()), vec![Box::new(CopyStrategy)]);
    let out = dir.path().join("hallo.wav");
    let path = adapter
        .tts_piper("Hallo", "Thorsten (DE)", &out, &PiperParams::default())
        .unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "RIFFHallo");

    adapter
        .tts_piper("Nochmal", "Thorsten (DE)", &out, &PiperParams::default())
        .unwrap();
    onnx.assert();
}

#[test]
fn test_configured_timeout_cuts_off_slow_download() {
    let mut server = mockito::Server::new();
    let _slow = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_secs(2));
            w.write_all(&model_bytes())
        })
        .create();

    let dir = tempfile::tempdir().unwrap();
    let err = repo(&server, dir.path())
        .with_timeout(Duration::from_millis(300))
        .ensure_model("Amy (US)")
        .unwrap_err();
    assert!(matches!(err, TtsError::Download { .. }));
    assert!(model_dir_entries(dir.path()).is_empty());
}

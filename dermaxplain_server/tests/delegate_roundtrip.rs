use std::sync::Arc;
use std::time::Duration;

use dermaxplain::core_modules::delegate::RemoteDelegate;
use dermaxplain::{AppConfig, Explainer, LocalExplainer, Oracle, PrototypeOracle, ScanPipeline};
use dermaxplain_server::{AppState, build_router};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

fn lesion_png() -> Vec<u8> {
    let mut img = RgbImage::from_pixel(72, 72, Rgb([200, 160, 140]));
    for y in 24..48 {
        for x in 24..48 {
            img.put_pixel(x, y, Rgb([70, 45, 40]));
        }
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn test_config(temp_root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.sampling.budget = 16;
    config.sampling.seed = Some(11);
    config.jobs.workers = 1;
    config.jobs.temp_root = Some(temp_root.to_path_buf());
    config
}

/// Serves the full router on an ephemeral port and returns its base URL.
async fn spawn_server(config: &AppConfig) -> (String, Arc<ScanPipeline>) {
    let oracle: Arc<dyn Oracle> = Arc::new(PrototypeOracle::from_config(&config.model));
    let pipeline = Arc::new(ScanPipeline::from_config(config, oracle.clone()).unwrap());
    let explainer = Arc::new(LocalExplainer::from_config(oracle, config));
    let app = build_router(AppState::new(pipeline.clone(), explainer), config.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), pipeline)
}

#[tokio::test]
async fn test_remote_delegate_receives_both_artifacts() {
    let temp_root = tempfile::tempdir().unwrap();
    let config = test_config(temp_root.path());
    let (base, _) = spawn_server(&config).await;

    let workspace = tempfile::tempdir().unwrap();
    let image_path = workspace.path().join("source.png");
    std::fs::write(&image_path, lesion_png()).unwrap();

    let delegate = RemoteDelegate::new(format!("{base}/explain"), Duration::from_secs(30)).unwrap();
    let artifacts = delegate.explain(&image_path, workspace.path()).await;

    assert!(artifacts.shap_base64.is_some());
    assert!(artifacts.occlusion_base64.is_some());
    assert!(artifacts.errors.is_empty());
}

#[tokio::test]
async fn test_classify_then_read_back() {
    let temp_root = tempfile::tempdir().unwrap();
    let config = test_config(temp_root.path());
    let (base, pipeline) = spawn_server(&config).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(lesion_png()).file_name("scan.png").mime_str("image/png").unwrap(),
        )
        .text("patient_name", "Jane Roe");
    let response = client.post(format!("{base}/scan/classify")).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let created: serde_json::Value = response.json().await.unwrap();
    assert_eq!(created["prediction"]["status"], "classified");
    assert_eq!(created["metadata"]["patient_name"], "Jane Roe");
    let id = created["id"].as_str().unwrap().to_string();

    // Drain the job queue so the read below sees the finished job.
    pipeline.shutdown().await;

    let fetched: serde_json::Value = client
        .get(format!("{base}/scan/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["explanation_state"]["state"], "complete");
    assert!(fetched["explanations"]["shap_base64"].is_string());
    assert!(fetched["explanations"]["occlusion_base64"].is_string());
}

#[tokio::test]
async fn test_error_statuses() {
    let temp_root = tempfile::tempdir().unwrap();
    let config = test_config(temp_root.path());
    let (base, _) = spawn_server(&config).await;
    let client = reqwest::Client::new();

    let garbage = reqwest::multipart::Form::new().part("file", reqwest::multipart::Part::bytes(b"not an image".to_vec()));
    let response = client.post(format!("{base}/scan/classify")).multipart(garbage).send().await.unwrap();
    assert_eq!(response.status(), 422);

    let no_file = reqwest::multipart::Form::new().text("patient_name", "x");
    let response = client.post(format!("{base}/scan/classify")).multipart(no_file).send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = client.get(format!("{base}/scan/not-a-uuid")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let response = client
        .get(format!("{base}/scan/{}", dermaxplain::ScanId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

use dermaxplain::config::AppConfig;
use dermaxplain::core_modules::delegate::RemoteDelegate;
use dermaxplain::core_modules::explainer::EngineSettings;
use dermaxplain::core_modules::occlusion::{OcclusionConfig, occlude};
use dermaxplain::core_modules::renderer::RenderConfig;
use dermaxplain::core_modules::sampling::SamplingConfig;
use dermaxplain::core_modules::scan_store::{FileScanStore, InMemoryScanStore};
use dermaxplain::{
    CanonicalImage, Classification, ExplanationJob, ExplanationState, JobOutcome, LocalExplainer, Oracle,
    PrototypeOracle, ScanRecord, ScanStore, run_job,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Dark lesion-like blob on lighter skin.
fn lesion_png(width: u32, height: u32, lesion: [u8; 3]) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(width, height, Rgb([200, 160, 140]));
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = width.min(height) as f32 / 4.0;
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        if (x as f32 - cx).hypot(y as f32 - cy) < radius {
            *pixel = Rgb(lesion);
        }
    }
    encode_png(&img)
}

fn oracle() -> Arc<dyn Oracle> {
    Arc::new(PrototypeOracle::from_config(&AppConfig::default().model))
}

fn settings() -> EngineSettings {
    EngineSettings {
        occlusion: OcclusionConfig {
            patch_size: 16,
            stride: 8,
        },
        sampling: SamplingConfig {
            budget: 24,
            seed: Some(42),
            ..SamplingConfig::default()
        },
        render: RenderConfig::default(),
    }
}

fn baseline() -> Classification {
    Classification::Classified {
        class_index: 1,
        code: "mel".into(),
        readable_name: "Melanoma".into(),
        confidence: 0.55,
    }
}

async fn create_record(store: &dyn ScanStore) -> ScanRecord {
    let record = ScanRecord::new(baseline(), BTreeMap::new());
    store.create(record.clone()).await.unwrap();
    record
}

fn assert_empty(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir).unwrap().collect();
    assert!(leftovers.is_empty(), "temporary files left behind: {leftovers:?}");
}

#[test]
fn test_uniform_image_occlusion_is_all_zero() {
    let image = CanonicalImage::uniform(64, [128, 128, 128]);
    let oracle = oracle();
    let grid = occlude(
        &image,
        oracle.as_ref(),
        &OcclusionConfig {
            patch_size: 16,
            stride: 8,
        },
    )
    .unwrap();

    assert_eq!(grid.dims(), (64, 64));
    assert!(grid.values().iter().all(|v| *v == 0.0));
}

#[tokio::test]
async fn test_unreachable_delegate_leaves_artifacts_unset() {
    let temp_root = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store = FileScanStore::open(store_dir.path()).unwrap();
    let record = create_record(&store).await;

    let delegate = RemoteDelegate::new("http://127.0.0.1:1/explain", Duration::from_secs(2)).unwrap();
    let job = ExplanationJob {
        scan_id: record.id.clone(),
        image_bytes: lesion_png(64, 64, [70, 45, 40]),
        baseline: baseline(),
    };
    let outcome = run_job(&delegate, &store, temp_root.path(), job).await;
    assert!(matches!(outcome, JobOutcome::Failed { .. }));

    let stored = store.get(&record.id).await.unwrap();
    assert_eq!(stored.prediction, baseline());
    assert_eq!(stored.explanations.shap_base64, None);
    assert_eq!(stored.explanations.occlusion_base64, None);
    match stored.state() {
        ExplanationState::Failed { reason } => assert!(reason.contains("delegate")),
        other => panic!("unexpected state {other:?}"),
    }
    assert_empty(temp_root.path());
}

#[tokio::test]
async fn test_second_job_for_same_scan_wins() {
    let temp_root = tempfile::tempdir().unwrap();
    let store = InMemoryScanStore::new();
    let record = create_record(&store).await;
    let explainer = LocalExplainer::new(oracle(), settings());

    let first_image = lesion_png(64, 64, [70, 45, 40]);
    let second_image = lesion_png(96, 72, [170, 55, 65]);
    let expected = explainer.explain_bytes(second_image.clone(), None).await;
    let unexpected = explainer.explain_bytes(first_image.clone(), None).await;
    assert!(expected.shap_base64.is_some() && expected.occlusion_base64.is_some());

    for image_bytes in [first_image, second_image] {
        let job = ExplanationJob {
            scan_id: record.id.clone(),
            image_bytes,
            baseline: baseline(),
        };
        let outcome = run_job(&explainer, &store, temp_root.path(), job).await;
        assert!(matches!(outcome, JobOutcome::Completed { artifacts: 2, .. }));
    }

    let stored = store.get(&record.id).await.unwrap().explanations;
    assert_eq!(stored.shap_base64, expected.shap_base64);
    assert_eq!(stored.occlusion_base64, expected.occlusion_base64);
    assert_ne!(stored.occlusion_base64, unexpected.occlusion_base64);
    assert_eq!(stored.job_version, 2);
    assert_empty(temp_root.path());
}

#[tokio::test]
async fn test_rerunning_a_job_is_idempotent() {
    let temp_root = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store = FileScanStore::open(store_dir.path()).unwrap();
    let record = create_record(&store).await;
    let explainer = LocalExplainer::new(oracle(), settings());
    let image = lesion_png(80, 80, [70, 45, 40]);

    let job = ExplanationJob {
        scan_id: record.id.clone(),
        image_bytes: image,
        baseline: baseline(),
    };
    run_job(&explainer, &store, temp_root.path(), job.clone()).await;
    let once = store.get(&record.id).await.unwrap().explanations;
    run_job(&explainer, &store, temp_root.path(), job).await;
    let twice = store.get(&record.id).await.unwrap().explanations;

    assert_eq!(once.shap_base64, twice.shap_base64);
    assert_eq!(once.occlusion_base64, twice.occlusion_base64);
    assert_eq!(twice.state(), ExplanationState::Complete);
    assert_empty(temp_root.path());
}

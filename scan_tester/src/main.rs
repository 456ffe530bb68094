use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dermaxplain::config::AppConfig;
use dermaxplain::core_modules::oracle::classify_image;
use dermaxplain::logging::init_logger;
use dermaxplain::{CanonicalImage, ClassSet, Classification, Explainer, LocalExplainer, Oracle, PrototypeOracle};
use dotenv::dotenv;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "scan-tester")]
#[command(about = "Classify one image and write its explanation overlays to disk", long_about = None)]
struct Cli {
    /// Image to classify and explain
    image: PathBuf,
    /// Directory receiving shap.png and occlusion.png
    #[arg(short, long, default_value = "./explanations")]
    out: PathBuf,
    /// Configuration file, instead of DermaXplain.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guard = init_logger();
    let args = Cli::parse();

    // --- 1. Configuration & Oracle ---
    let config = match &args.config {
        Some(path) => AppConfig::load_from(Some(path.as_path())),
        None => AppConfig::load(),
    }?;
    let oracle: Arc<dyn Oracle> = Arc::new(PrototypeOracle::from_config(&config.model));
    let classes = ClassSet::from_config(&config.model);

    // --- 2. Classification ---
    let bytes = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("reading {}", args.image.display()))?;
    let canonical = CanonicalImage::decode(&bytes, oracle.input_size())?;
    match classify_image(oracle.as_ref(), &classes, &canonical) {
        Classification::Classified {
            code,
            readable_name,
            confidence,
            ..
        } => println!("Prediction: {readable_name} ({code}) with confidence {confidence:.4}"),
        Classification::ClassificationFailed { reason } => println!("Classification failed: {reason}"),
    }

    // --- 3. Explanation ---
    tokio::fs::create_dir_all(&args.out)
        .await
        .with_context(|| format!("creating {}", args.out.display()))?;
    let explainer = LocalExplainer::from_config(oracle, &config);
    let artifacts = explainer.explain(&args.image, &args.out).await;

    for engine in dermaxplain::EngineKind::ALL {
        match (artifacts.get(engine), artifacts.errors.get(&engine)) {
            (Some(_), _) => println!("{engine}: {}", args.out.join(format!("{engine}.png")).display()),
            (None, Some(reason)) => println!("{engine}: failed ({reason})"),
            (None, None) => println!("{engine}: no artifact"),
        }
    }
    info!(out = %args.out.display(), "explanation written");
    Ok(())
}

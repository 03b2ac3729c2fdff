use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{Backend, EmbeddingExtractor, FaceDetector};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facegate.Registry1",
    default_service = "org.facegate.Registry1",
    default_path = "/org/facegate/Registry1"
)]
trait Registry {
    async fn enroll(&self, image: &[u8]) -> zbus::Result<String>;
    async fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face enrollment and verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image as a new identity
    Enroll {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Identify the face in an image
    Verify {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
    /// Run detection and extraction locally, bypassing the daemon
    Extract {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long, default_value_os_t = facegate_core::default_model_dir())]
        model_dir: PathBuf,
        /// Embedding backend: canonical-crop or landmark
        #[arg(long, default_value = "canonical-crop")]
        backend: Backend,
        /// Minimum detector confidence
        #[arg(long, default_value_t = facegate_core::detector::SCRFD_DEFAULT_CONFIDENCE)]
        confidence: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(cli.session).await?;
            print_json(&proxy.enroll(&bytes).await.context("enrollment failed")?)?;
        }
        Commands::Verify { image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(cli.session).await?;
            print_json(&proxy.verify(&bytes).await.context("verification failed")?)?;
        }
        Commands::List => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Remove { id } => {
            let proxy = connect(cli.session).await?;
            if proxy.remove_identity(&id).await? {
                println!("removed {id}");
            } else {
                anyhow::bail!("no identity with id {id}");
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Extract {
            image,
            model_dir,
            backend,
            confidence,
        } => extract_local(&image, &model_dir, backend, confidence)?,
    }

    Ok(())
}

async fn connect(session: bool) -> Result<RegistryProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    RegistryProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Detector and extractor diagnostics without the daemon or the registry.
fn extract_local(image: &Path, model_dir: &Path, backend: Backend, confidence: f32) -> Result<()> {
    let bytes = read_image(image)?;
    let decoded = facegate_core::preprocess::decode_image(&bytes)?;
    println!("image: {}x{}", decoded.width(), decoded.height());

    let detector_path = model_dir.join(facegate_core::DETECTOR_MODEL_FILE);
    tracing::debug!(path = %detector_path.display(), "loading detector");
    let mut detector =
        facegate_core::ScrfdDetector::load(&detector_path.to_string_lossy(), confidence)?;
    let faces = detector.detect(&decoded)?;
    println!("faces detected: {}", faces.len());
    for (i, face) in faces.iter().enumerate() {
        println!(
            "  [{i}] x={:.0} y={:.0} w={:.0} h={:.0} confidence={:.3} landmarks={}",
            face.x,
            face.y,
            face.width,
            face.height,
            face.confidence,
            face.landmarks.is_some()
        );
    }

    let face = facegate_core::detector::single_face(faces)
        .map_err(facegate_core::PipelineError::from)?;

    let model_path = model_dir.join(facegate_core::model_file(backend));
    let mut extractor =
        facegate_core::extractor::load_extractor(backend, &model_path.to_string_lossy())?;
    let embedding = extractor.extract(&decoded, &face)?;
    println!(
        "embedding: backend={} dimension={} norm={:.4}",
        embedding.backend,
        embedding.len(),
        embedding.norm()
    );
    println!("{}", serde_json::to_string(&embedding.values)?);
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facematch_core::{
    CascadeLocator, FaceService, GalleryDir, ServiceSettings, Snapshot, Thresholds,
    ValidationParams,
};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CASCADE: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";

// Async proxy for the daemon interface.
#[zbus::proxy(
    gen_blocking = false,
    interface = "org.facematch.Facematch1",
    default_service = "org.facematch.Facematch1",
    default_path = "/org/facematch/Facematch1"
)]
trait Facematch {
    async fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, paths: &[&str]) -> zbus::Result<String>;
    async fn retrain(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "facematch face enrollment and recognition CLI")]
struct Cli {
    #[command(flatten)]
    local: LocalArgs,

    /// Send the command to a running facematchd instead of working on the gallery directly
    #[arg(long, global = true)]
    daemon: bool,

    /// Talk to the daemon on the system bus (default: session bus)
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LocalArgs {
    /// Gallery directory (one sub-directory per identity)
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,

    /// OpenCV Haar cascade XML
    #[arg(long, global = true, default_value = DEFAULT_CASCADE)]
    cascade: PathBuf,

    /// Strict-tier confidence threshold
    #[arg(long, global = true, default_value_t = 80.0)]
    strict: f64,

    /// Moderate-tier confidence threshold
    #[arg(long, global = true, default_value_t = 100.0)]
    moderate: f64,

    /// Cross-validation similarity threshold
    #[arg(long, global = true, default_value_t = 0.55)]
    similarity: f64,

    /// Minimum fraction of similar reference comparisons
    #[arg(long, global = true, default_value_t = 0.3)]
    min_ratio: f64,

    /// Strict candidates at or above this confidence fail validation
    #[arg(long, global = true, default_value_t = 95.0)]
    max_confidence: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Add reference images to an identity and retrain
    Enroll {
        /// Identity name
        name: String,
        /// Reference images (.jpg, .jpeg, .png)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Retrain the model from the gallery and print the training report
    Train,
    /// Identify the face in an image
    Identify {
        /// Query image
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let output = if cli.daemon {
        run_remote(cli.command, cli.system).await?
    } else {
        if matches!(cli.command, Commands::Status) {
            bail!("status needs a running daemon; pass --daemon");
        }
        run_local(cli.command, &cli.local)?
    };

    println!("{output}");
    Ok(())
}

async fn run_remote(command: Commands, system: bool) -> Result<String> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    tracing::debug!(system, "connected to D-Bus");
    let proxy = FacematchProxy::new(&conn)
        .await
        .context("facematchd is not reachable")?;

    let out = match command {
        Commands::Enroll { name, images } => {
            // The daemon resolves paths itself, so send them absolute.
            let absolute = images
                .iter()
                .map(|p| std::fs::canonicalize(p).map(|p| p.display().to_string()))
                .collect::<std::io::Result<Vec<_>>>()?;
            let refs: Vec<&str> = absolute.iter().map(String::as_str).collect();
            proxy.enroll(&name, &refs).await?
        }
        Commands::Train => proxy.retrain().await?,
        Commands::Identify { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            proxy.identify(&bytes).await?
        }
        Commands::List => proxy.list_identities().await?,
        Commands::Status => proxy.status().await?,
    };
    Ok(out)
}

fn run_local(command: Commands, args: &LocalArgs) -> Result<String> {
    let service = build_service(args)?;
    tracing::debug!(
        strict = args.strict,
        moderate = args.moderate,
        "working on the gallery directly"
    );

    let value = match command {
        Commands::Enroll { name, images } => {
            let snapshot = service.enroll(&name, &images)?;
            summary(&snapshot)
        }
        Commands::Train => {
            let snapshot = service.retrain()?;
            summary(&snapshot)
        }
        Commands::Identify { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            service.retrain()?;
            serde_json::to_value(service.identify_response(&bytes))?
        }
        Commands::List => {
            let snapshot = service.retrain()?;
            let identities = service.source().identities()?;
            serde_json::Value::Array(
                identities
                    .into_iter()
                    .map(|identity| {
                        serde_json::json!({
                            "name": identity.name,
                            "label": snapshot.labels.label_of(&identity.name),
                            "references": identity.references.len(),
                        })
                    })
                    .collect(),
            )
        }
        Commands::Status => bail!("status needs a running daemon; pass --daemon"),
    };
    Ok(serde_json::to_string_pretty(&value)?)
}

fn build_service(args: &LocalArgs) -> Result<FaceService> {
    let gallery_dir = args.gallery.clone().unwrap_or_else(default_gallery_dir);
    tracing::debug!(
        gallery = %gallery_dir.display(),
        cascade = %args.cascade.display(),
        "opening gallery"
    );
    let gallery = GalleryDir::open(&gallery_dir)
        .with_context(|| format!("cannot open gallery {}", gallery_dir.display()))?;
    let locator = CascadeLocator::load(&args.cascade)
        .with_context(|| format!("cannot load cascade {}", args.cascade.display()))?;

    let settings = ServiceSettings {
        thresholds: Thresholds {
            strict: args.strict,
            moderate: args.moderate,
        },
        validation: ValidationParams {
            similarity_threshold: args.similarity,
            min_ratio: args.min_ratio,
            max_confidence: args.max_confidence,
        },
    };
    Ok(FaceService::new(Arc::new(gallery), Arc::new(locator), settings))
}

fn summary(snapshot: &Snapshot) -> serde_json::Value {
    serde_json::json!({
        "identities": snapshot.labels.iter().map(|(_, n)| n).collect::<Vec<_>>(),
        "samples": snapshot.model.sample_count(),
        "unrecognizable": snapshot.report.unrecognizable().collect::<Vec<_>>(),
        "report": snapshot.report,
    })
}

fn default_gallery_dir() -> PathBuf {
    std::env::var("FACEMATCH_GALLERY_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("facematch/gallery")
        })
}

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

mod preview;
mod run;

#[derive(Parser, Debug)]
#[command(name = "lso-operator", version, about = "Logstash operator")]
struct Cli {
    /// Prometheus exporter listen address (host:port); disabled when unset
    #[arg(long = "metrics-addr", env = "LSO_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile Logstash resources in the current cluster until interrupted
    Run(RunArgs),
    /// Print the artifacts generated for resources in a YAML file, without a cluster
    Preview {
        /// Multi-document YAML with Logstash* resources
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespace for documents that do not set one
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
        #[arg(long = "image", env = "LSO_IMAGE", default_value = lso_render::DEFAULT_IMAGE)]
        image: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", env = "LSO_NAMESPACE")]
    pub namespace: Option<String>,
    /// Logstash image for workloads that do not set one
    #[arg(long = "image", env = "LSO_IMAGE", default_value = lso_render::DEFAULT_IMAGE)]
    pub image: String,
    /// Attempts per generation bump on conflict
    #[arg(long = "bump-attempts", env = "LSO_BUMP_ATTEMPTS", default_value_t = 3)]
    pub bump_attempts: u32,
    /// Periodic resync of pipelines and deployments
    #[arg(long = "requeue-secs", env = "LSO_REQUEUE_SECS", default_value_t = 300)]
    pub requeue_secs: u64,
    /// Delay before retrying after a retryable error
    #[arg(long = "error-backoff-secs", env = "LSO_ERROR_BACKOFF_SECS", default_value_t = 5)]
    pub error_backoff_secs: u64,
    /// Capacity of the element event queue
    #[arg(long = "queue-cap", env = "LSO_QUEUE_CAP", default_value_t = 1024)]
    pub queue_cap: usize,
}

fn init_tracing() {
    let env = std::env::var("LSO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        tracing::warn!(addr = %addr, "invalid LSO_METRICS_ADDR; expected host:port");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    match cli.command {
        Commands::Run(args) => {
            info!(ns = ?args.namespace, image = %args.image, "starting operator");
            run::run(args).await
        }
        Commands::Preview { file, namespace, image, output } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let artifacts = preview::render(&text, &namespace, &image).await?;
            match output {
                Output::Yaml => {
                    for a in &artifacts {
                        print!("---\n{}", serde_yaml::to_string(a)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&artifacts)?),
            }
            Ok(())
        }
    }
}

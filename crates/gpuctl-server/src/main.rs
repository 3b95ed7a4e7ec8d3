use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gpuctl_core::config::Config;
use gpuctl_core::metrics::gpu;
use gpuctl_core::Controller;
use gpuctl_server::state::AppState;
use tracing::{error, info};

/// CLI surface for the single-GPU-host inference control plane.
#[derive(Debug, Parser)]
#[command(name = "gpuctl", version, about)]
struct Args {
    #[arg(long, env = "GPUCTL_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "GPUCTL_PORT", default_value_t = 8000)]
    port: u16,

    #[arg(long, env = "GPUCTL_INFERENCE_PORT", default_value_t = 8001)]
    inference_port: u16,

    #[arg(long, env = "GPUCTL_UPSTREAM_BASE_URL", default_value = "http://127.0.0.1:8001")]
    upstream_base_url: String,

    #[arg(long, env = "GPUCTL_UPSTREAM_TOKEN")]
    upstream_token: Option<String>,

    #[arg(long, env = "GPUCTL_LOG_DIR", default_value = "/tmp/gpuctl/logs")]
    log_dir: PathBuf,

    #[arg(long, env = "GPUCTL_RECIPE_DIR", default_value = "/etc/gpuctl/recipes")]
    recipe_dir: PathBuf,

    #[arg(long, env = "GPUCTL_LIFETIME_DB", default_value = "/tmp/gpuctl/lifetime.db")]
    lifetime_db_path: PathBuf,

    #[arg(long, env = "GPUCTL_METRICS_TICK_SECS", default_value_t = 1)]
    metrics_tick_secs: u64,

    #[arg(long, env = "GPUCTL_LOG_PREFIX", default_value = "backend")]
    log_prefix: String,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            host: args.host,
            port: args.port,
            inference_port: args.inference_port,
            upstream_base_url: args.upstream_base_url,
            upstream_token: args.upstream_token,
            log_dir: args.log_dir,
            recipe_dir: args.recipe_dir,
            lifetime_db_path: args.lifetime_db_path,
            metrics_tick: Duration::from_secs(args.metrics_tick_secs),
            log_prefix: args.log_prefix,
        }
    }
}

#[tokio::main]
async fn main() {
    gpuctl_core::logging::init();

    let args = Args::parse();
    let config: Config = args.into();
    let bind_addr = format!("{}:{}", config.host, config.port);

    let (controller, metrics_collector) = match Controller::build(config) {
        Ok(built) => built,
        Err(e) => {
            error!(error = %e, "failed to build controller");
            std::process::exit(1);
        }
    };

    // The metrics loop runs for the lifetime of the process; the backend it
    // watches is never killed on our own exit.
    tokio::spawn(async move {
        metrics_collector.run().await;
    });

    let gpu_source: Arc<dyn gpu::GpuSource> = Arc::from(gpu::detect_source());
    let state = AppState {
        controller,
        gpu_source,
    };

    let app = gpuctl_server::router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "gpuctl listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

//! Core state machine for the single-GPU-host inference control plane.
//! The binary crate (`gpuctl-server`) only wires this up to HTTP.

pub mod chat_proxy;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod lifetime_store;
pub mod log_tailer;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod readiness;
pub mod recipe;
pub mod recipes;
pub mod supervisor;

use std::sync::Arc;

use chat_proxy::ChatProxy;
use config::Config;
use error::Result;
use event_bus::EventBus;
use lifetime_store::LifetimeStore;
use metrics::MetricsCollector;
use process::ProcessOwner;
use readiness::ReadinessProbe;
use recipes::RecipeSet;
use supervisor::Supervisor;

/// Bundles every long-lived component the HTTP layer needs a handle to.
/// Constructed once at startup; cheap to clone (everything inside is an
/// `Arc`).
#[derive(Clone)]
pub struct Controller {
    pub config: Config,
    pub supervisor: Arc<Supervisor>,
    pub event_bus: Arc<EventBus>,
    pub recipes: Arc<RecipeSet>,
    pub lifetime: Arc<LifetimeStore>,
    pub chat_proxy: Arc<ChatProxy>,
}

impl Controller {
    /// Builds every component from `config` and loads recipes once from
    /// `config.recipe_dir`. Does not start the metrics loop; the caller
    /// spawns `MetricsCollector::run` on its own task (it needs a separate
    /// `ProcessOwner` so it never contends with the supervisor's process
    /// lookups on the same mutex-free, side-effect-free `find`).
    pub fn build(config: Config) -> Result<(Self, MetricsCollector)> {
        let inspector: Arc<dyn process::ProcessInspector> =
            Arc::new(process::SysinfoInspector::default());

        let supervisor_owner = ProcessOwner::new(
            inspector.clone(),
            config.log_dir.clone(),
            config.log_prefix.clone(),
        );
        let metrics_owner = ProcessOwner::new(
            inspector,
            config.log_dir.clone(),
            config.log_prefix.clone(),
        );

        let readiness = ReadinessProbe::new(Arc::new(process::SysinfoInspector::default()));
        let event_bus = Arc::new(EventBus::new());

        let recipe_map = recipes::load_dir(&config.recipe_dir)?;
        let recipes = Arc::new(RecipeSet::new(recipe_map));

        let lifetime = Arc::new(LifetimeStore::open(&config.lifetime_db_path)?);

        let supervisor = Arc::new(Supervisor::new(
            supervisor_owner,
            readiness,
            event_bus.clone(),
            recipes.clone(),
            config.inference_port,
        ));

        let chat_proxy = Arc::new(ChatProxy::new(
            config.upstream_base_url.clone(),
            config.upstream_token.clone(),
            supervisor.clone(),
        ));

        let metrics_collector = MetricsCollector::new(
            metrics_owner,
            event_bus.clone(),
            lifetime.clone(),
            config.inference_port,
            config.metrics_tick,
        );

        Ok((
            Controller {
                config,
                supervisor,
                event_bus,
                recipes,
                lifetime,
                chat_proxy,
            },
            metrics_collector,
        ))
    }
}

//! Per-scrape registries.
use std::time::Duration;

use stackdriver_exposition::Registry;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::ApiClient;
use crate::collector::{
    CollectorInitError, DeltaStores, MonitoringCollector, MonitoringCollectorOptions, ProjectState,
};
use crate::prefixes::SelectionSet;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Builds a fresh registry of monitoring collectors for every scrape.
///
/// Everything that must survive a scrape (delta stores, descriptor caches, telemetry) is held
/// here and shared with the collectors; the registries themselves are dropped with their
/// request, so concurrent scrapes with different selections never observe each other.
pub struct RegistryAssembler {
    projects: Vec<(String, ProjectState)>,
    options: MonitoringCollectorOptions,
    client: ApiClient,
    deltas: DeltaStores,
}

impl RegistryAssembler {
    /// Creates a new [`RegistryAssembler`] for the given projects.
    pub fn new(
        project_ids: Vec<String>,
        options: MonitoringCollectorOptions,
        client: ApiClient,
        deltas: DeltaStores,
    ) -> Self {
        let projects = project_ids
            .into_iter()
            .map(|project_id| {
                let state = ProjectState::new(&options);
                (project_id, state)
            })
            .collect();

        RegistryAssembler { projects, options, client, deltas }
    }

    /// Gets the collected projects.
    pub fn project_ids(&self) -> impl Iterator<Item = &str> {
        self.projects.iter().map(|(project_id, _)| project_id.as_str())
    }

    /// Gets the collection settings shared by every scrape.
    pub fn options(&self) -> &MonitoringCollectorOptions {
        &self.options
    }

    /// Builds the registry of a scrape restricted to `selection`.
    ///
    /// ## Errors
    ///
    /// If any collector cannot be built, an error is returned and no registry is produced.
    pub fn build(&self, selection: &SelectionSet) -> Result<Registry, CollectorInitError> {
        let options = self.options.scoped(selection);
        debug!(prefixes = ?options.metric_type_prefixes, "building scrape registry");

        let mut registry = Registry::new();
        for (project_id, state) in &self.projects {
            let collector = MonitoringCollector::new(
                project_id.clone(),
                self.client.clone(),
                options.clone(),
                self.deltas.clone(),
                state.clone(),
            )?;
            registry.register(Box::new(collector))?;
        }
        Ok(registry)
    }

    /// Builds and discards one registry, to surface configuration errors before serving.
    ///
    /// ## Errors
    ///
    /// If any collector cannot be built, an error is returned.
    pub fn validate(&self) -> Result<(), CollectorInitError> {
        self.build(&SelectionSet::all()).map(|_| ())
    }
}

/// Spawns a task that periodically evicts expired series from the delta stores.
///
/// The stores are swept every `min(ttl, 60s)`, and at least once a second.
pub fn spawn_delta_sweeper(deltas: DeltaStores) -> JoinHandle<()> {
    let period = deltas.ttl().min(MAX_SWEEP_INTERVAL).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let evicted = deltas.sweep();
            if evicted > 0 {
                debug!(evicted, "evicted expired delta series");
            }
        }
    })
}

//! Periodic drivers: probe rounds and route reconciliation.
//!
//! The probe loop and the apply loop run as independent tasks. Stopping the
//! agent stops scheduling new work; a round already in flight ends at its
//! own timeout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::Result;
use crate::probe::{ProbeConfig, ProbeStats, Prober};
use crate::routing::{RouteAdapter, Router, RouterConfig};

/// Drives a [`Router`] with a [`Prober`].
pub struct Agent {
    probe: ProbeConfig,
    router_config: RouterConfig,
    router: Arc<Router>,
    prober: Arc<Prober>,
    /// Results of the most recent finished round.
    last_round: Arc<RwLock<HashMap<IpAddr, ProbeStats>>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Set once by `stop()`; a stopped agent never starts again.
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Create an agent from parts.
    pub fn new(probe: ProbeConfig, router_config: RouterConfig, router: Arc<Router>, prober: Arc<Prober>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            probe,
            router_config,
            router,
            prober,
            last_round: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build router and prober from configuration.
    ///
    /// Fails if no ICMP socket can be opened. Must be called from within a
    /// tokio runtime.
    pub fn from_config(config: &Config, adapter: Arc<dyn RouteAdapter>) -> Result<Self> {
        config.validate()?;
        let prober = Arc::new(Prober::new(&config.probe)?);
        let router = Arc::new(Router::new(config.selection.clone(), adapter));
        Ok(Self::new(config.probe.clone(), config.router.clone(), router, prober))
    }

    /// Like [`Agent::from_config`], installing routes through the OS tools.
    pub fn with_system_routes(config: &Config) -> Result<Self> {
        Self::from_config(config, Arc::new(config.router.system_adapter()))
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    /// Results of the most recent finished probe round.
    pub fn last_round(&self) -> HashMap<IpAddr, ProbeStats> {
        self.last_round.read().clone()
    }

    /// Spawn the probe and apply loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if self.stopped.load(Ordering::SeqCst) {
            tracing::warn!("Agent already stopped, not starting");
            return;
        }
        if !tasks.is_empty() {
            tracing::warn!("Agent already started");
            return;
        }
        tasks.push(self.spawn_probe_loop());
        tasks.push(self.spawn_apply_loop());
        tracing::info!(
            probe_interval = ?self.probe.interval,
            apply_interval = ?self.router_config.apply_interval,
            "Agent started"
        );
    }

    fn spawn_probe_loop(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let prober = Arc::clone(&self.prober);
        let last_round = Arc::clone(&self.last_round);
        let config = self.probe.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut results = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        // The router lock may be held by a running apply.
                        let lookup = Arc::clone(&router);
                        let destinations = match tokio::task::spawn_blocking(move || lookup.destinations()).await {
                            Ok(destinations) => destinations,
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to list probe destinations");
                                continue;
                            }
                        };
                        if destinations.is_empty() {
                            continue;
                        }

                        results.clear();
                        prober.probe(&destinations, config.timeout, &mut results).await;

                        let round = results.clone();
                        let router = Arc::clone(&router);
                        if let Err(e) = tokio::task::spawn_blocking(move || router.record_round(&round)).await {
                            tracing::warn!(error = %e, "Failed to record probe round");
                        }
                        *last_round.write() = results.clone();
                    }
                }
            }
            tracing::debug!("Probe loop stopped");
        })
    }

    fn spawn_apply_loop(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let period = self.router_config.apply_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        let router = Arc::clone(&router);
                        match tokio::task::spawn_blocking(move || router.apply()).await {
                            Ok(report) => {
                                let errors = report.errors().count();
                                if errors > 0 {
                                    tracing::warn!(
                                        errors = errors,
                                        iterations = report.iterations,
                                        "Route reconciliation finished with errors"
                                    );
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Route reconciliation task failed"),
                        }
                    }
                }
            }
            tracing::debug!("Apply loop stopped");
        })
    }

    /// Stop scheduling new rounds and reconciliations.
    ///
    /// Stopping is final: a later [`start`](Self::start) does nothing.
    pub fn stop(&self) {
        // Hold the task lock so a concurrent start either sees the flag or
        // has already subscribed to the signal.
        let _tasks = self.tasks.lock();
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for both loops to exit.
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Agent task failed");
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("probe", &self.probe)
            .field("router", &self.router)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ipnetwork::IpNetwork;

    use crate::multipath::SelectorConfig;

    struct NullAdapter;

    impl RouteAdapter for NullAdapter {
        fn route_add(&self, _: &str, _: Option<IpAddr>, _: &IpNetwork) -> Result<()> {
            Ok(())
        }

        fn route_del(&self, _: &str, _: &IpNetwork) -> Result<()> {
            Ok(())
        }

        fn route_replace(&self, _: &str, _: Option<IpAddr>, _: &IpNetwork) -> Result<()> {
            Ok(())
        }

        fn route_conflict(&self, _: &IpNetwork) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn agent() -> Agent {
        let router = Arc::new(Router::new(SelectorConfig::default(), Arc::new(NullAdapter)));
        Agent::new(
            ProbeConfig::default(),
            RouterConfig::default(),
            router,
            Arc::new(Prober::without_sockets()),
        )
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let agent = agent();
        agent.stop();
        agent.start();

        assert!(agent.is_stopped());
        assert!(agent.tasks.lock().is_empty());
        tokio::time::timeout(Duration::from_secs(1), agent.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let agent = agent();
        agent.start();
        assert_eq!(agent.tasks.lock().len(), 2);

        agent.stop();
        tokio::time::timeout(Duration::from_secs(1), agent.join())
            .await
            .unwrap();
        assert!(agent.last_round().is_empty());
    }
}

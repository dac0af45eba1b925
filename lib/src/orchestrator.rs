//! Failover scenario
//!
//! ```plain
//! Init -> BaselineReady -> Degraded -> Recovered
//!              |              ^           |
//!              |              +-----------+ (more rounds)
//!              v                          v
//!        TimeoutFailure            TimeoutFailure
//! ```
//!
//! A pool that does not shrink by exactly the injected batch ends the
//! scenario in `InjectionFailure`.
//!
//! The proxy is started with the expected pool, the harness waits for the
//! whole pool, terminates a quarter of it, checks the loss right away without
//! pumping the loop, then waits for the proxy to restore the pool.

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng};

use failover_command_lib::{
    config::{Config, FaultMode, GroupSpec, ServerSpec},
    error, info, warn,
};

use crate::{
    controller::{ControllerError, ProxyController},
    event_loop::{EventLoop, LoopError, LoopOutcome, LoopStats},
    fault::{FaultInjector, FaultReport},
    metrics::{MetricError, Percentiles, RecoveryStats},
    registry::ConnectionRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    BaselineReady,
    Degraded,
    Recovered,
    TimeoutFailure,
    /// the pool did not lose exactly the injected batch
    InjectionFailure,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::BaselineReady => "baseline",
            Stage::Degraded => "degraded",
            Stage::Recovered => "recovered",
            Stage::TimeoutFailure => "timeout",
            Stage::InjectionFailure => "injection failure",
        };
        write!(f, "{name}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScenarioError {
    #[error("{stage} check failed: observed {observed} backend connections, expected {expected}")]
    Readiness {
        stage: Stage,
        observed: usize,
        expected: usize,
    },
    #[error("cannot {operation} in stage {stage}")]
    OutOfOrder {
        operation: &'static str,
        stage: Stage,
    },
    #[error("event loop: {0}")]
    Loop(#[from] LoopError),
    #[error("proxy controller: {0}")]
    Controller(#[from] ControllerError),
    #[error("metrics: {0}")]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub fault: FaultReport,
    /// connection count right after the injection
    pub degraded: usize,
    pub recovery: Duration,
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub expected: usize,
    pub baseline: Duration,
    pub rounds: Vec<RoundReport>,
    pub recovery: Percentiles,
    pub loop_stats: LoopStats,
    pub per_server: BTreeMap<String, usize>,
}

pub struct Orchestrator<C: ProxyController, R: Rng = StdRng> {
    config: Config,
    controller: C,
    event_loop: EventLoop,
    registry: ConnectionRegistry,
    injector: FaultInjector<R>,
    stats: RecoveryStats,
    stage: Stage,
    groups: Vec<GroupSpec>,
    running: bool,
    injected_at: Option<Instant>,
}

impl<C: ProxyController> Orchestrator<C, StdRng> {
    /// Victims are picked with `config.seed` when set, from entropy otherwise
    pub fn new(config: Config, controller: C) -> Result<Self, ScenarioError> {
        let injector = match config.seed {
            Some(seed) => FaultInjector::seeded(seed),
            None => FaultInjector::from_entropy(),
        };
        Orchestrator::with_injector(config, controller, injector)
    }
}

impl<C: ProxyController, R: Rng> Orchestrator<C, R> {
    pub fn with_injector(
        config: Config,
        controller: C,
        injector: FaultInjector<R>,
    ) -> Result<Self, ScenarioError> {
        let event_loop = EventLoop::new(config.poll_slice)?;
        let registry = event_loop.connection_registry(config.expected_conns_n())?;
        Ok(Orchestrator {
            config,
            controller,
            event_loop,
            registry,
            injector,
            stats: RecoveryStats::new()?,
            stage: Stage::Init,
            groups: Vec::new(),
            running: false,
            injected_at: None,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn expected(&self) -> usize {
        self.registry.expected()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// backend groups with the addresses actually listened on, once started
    pub fn groups(&self) -> &[GroupSpec] {
        &self.groups
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.event_loop.stats()
    }

    /// Binds one listener per backend server, then configures and starts the
    /// proxy with the bound addresses
    pub fn start(&mut self) -> Result<(), ScenarioError> {
        self.expect_stage("start the proxy", &[Stage::Init])?;

        let mut groups = Vec::with_capacity(self.config.groups.len());
        for group in &self.config.groups {
            let mut servers = Vec::with_capacity(group.servers.len());
            for (index, server) in group.servers.iter().enumerate() {
                let address = self.event_loop.add_listener(
                    format!("{}#{}", group.name, index),
                    server.address,
                    self.config.backlog,
                )?;
                servers.push(ServerSpec {
                    address,
                    conns_n: server.conns_n,
                });
            }
            groups.push(GroupSpec {
                name: group.name.clone(),
                servers,
            });
        }

        self.controller.configure(&groups)?;
        self.groups = groups;
        self.controller.start()?;
        self.running = true;
        info!(
            "proxy started, expecting {} backend connections",
            self.registry.expected()
        );
        Ok(())
    }

    /// Waits up to `timeout_limit` for the whole pool
    pub fn wait_baseline(&mut self) -> Result<Duration, ScenarioError> {
        self.expect_stage("wait for the baseline", &[Stage::Init])?;
        if !self.running {
            return Err(ScenarioError::OutOfOrder {
                operation: "wait for the baseline",
                stage: self.stage,
            });
        }

        let start = Instant::now();
        self.pump()?;
        if !self.registry.is_ready() {
            self.stage = Stage::TimeoutFailure;
            return Err(self.readiness_error(Stage::BaselineReady, self.registry.expected()));
        }

        let elapsed = start.elapsed();
        self.stage = Stage::BaselineReady;
        info!(
            "baseline reached in {:?}: {:?}",
            elapsed,
            self.registry.per_server_counts()
        );
        Ok(elapsed)
    }

    /// Terminates a batch and checks the loss without running the loop in
    /// between, so the proxy has no chance to reconnect yet
    pub fn inject(&mut self, mode: FaultMode) -> Result<FaultReport, ScenarioError> {
        self.expect_stage("inject a fault", &[Stage::BaselineReady, Stage::Recovered])?;

        let report = self.injector.inject(&mut self.registry, mode);
        self.injected_at = Some(Instant::now());

        let expected = self.registry.expected() - report.batch_size;
        if self.registry.size() != expected {
            self.stage = Stage::InjectionFailure;
            return Err(self.readiness_error(Stage::Degraded, expected));
        }
        self.stage = Stage::Degraded;
        Ok(report)
    }

    /// Waits up to `timeout_limit` for the proxy to restore the pool, returns
    /// the time elapsed since the injection
    pub fn wait_recovery(&mut self) -> Result<Duration, ScenarioError> {
        self.expect_stage("wait for recovery", &[Stage::Degraded])?;

        self.pump()?;
        let recovery = self
            .injected_at
            .take()
            .map(|injected_at| injected_at.elapsed())
            .unwrap_or_default();

        if !self.registry.is_ready() {
            self.stage = Stage::TimeoutFailure;
            return Err(self.readiness_error(Stage::Recovered, self.registry.expected()));
        }

        self.stats.record(recovery);
        self.stage = Stage::Recovered;
        info!("pool restored {:?} after the fault", recovery);
        Ok(recovery)
    }

    /// Runs the whole scenario, then stops the proxy whatever the outcome
    pub fn run(&mut self) -> Result<ScenarioReport, ScenarioError> {
        let result = self.run_rounds();
        if let Err(error) = &result {
            error!("scenario failed: {}", error);
        }
        match (result, self.shutdown()) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), Err(stop_error)) => {
                warn!("could not stop the proxy after a failure: {}", stop_error);
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
        }
    }

    fn run_rounds(&mut self) -> Result<ScenarioReport, ScenarioError> {
        self.start()?;
        let baseline = self.wait_baseline()?;

        let mut rounds = Vec::with_capacity(self.config.rounds);
        for round in 0..self.config.rounds {
            let fault = self.inject(self.config.fault_mode)?;
            let degraded = self.registry.size();
            let recovery = self.wait_recovery()?;
            info!(
                "round {}: {} lost {} connections, recovered in {:?}",
                round,
                fault.mode,
                fault.terminated.len(),
                recovery
            );
            rounds.push(RoundReport {
                fault,
                degraded,
                recovery,
            });
        }

        Ok(ScenarioReport {
            expected: self.registry.expected(),
            baseline,
            rounds,
            recovery: self.stats.percentiles(),
            loop_stats: self.event_loop.stats(),
            per_server: self.registry.per_server_counts(),
        })
    }

    /// Stops the proxy, then closes the remaining backend connections
    pub fn shutdown(&mut self) -> Result<(), ScenarioError> {
        let stopped = if self.running {
            self.running = false;
            self.controller.stop()
        } else {
            Ok(())
        };
        self.registry.close_all();
        Ok(stopped?)
    }

    fn pump(&mut self) -> Result<LoopOutcome, ScenarioError> {
        let outcome = self
            .event_loop
            .loop_for(&mut self.registry, self.config.timeout_limit)?;
        Ok(outcome)
    }

    fn expect_stage(&self, operation: &'static str, allowed: &[Stage]) -> Result<(), ScenarioError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(ScenarioError::OutOfOrder {
                operation,
                stage: self.stage,
            })
        }
    }

    fn readiness_error(&self, stage: Stage, expected: usize) -> ScenarioError {
        let error = ScenarioError::Readiness {
            stage,
            observed: self.registry.size(),
            expected,
        };
        error!("{}", error);
        error
    }
}

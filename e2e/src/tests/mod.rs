use std::net::SocketAddr;

use failover_command_lib::{
    config::{Config, FaultMode, GroupSpec, ServerSpec},
    logging::setup_default_logging,
};
use failover_lib::{
    controller::ProxyController,
    orchestrator::{Orchestrator, ScenarioError, ScenarioReport},
};

use crate::mock::pool_proxy::PoolProxy;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Success,
    Fail,
    Undecided,
}

/// Runs a scenario several times, stops at the first run that is not a success
pub fn repeat_until_error_or<F>(times: usize, test_description: &str, test: F) -> State
where
    F: Fn() -> State,
{
    println!("{test_description}");
    for i in 1..=times {
        let state = test();
        match state {
            State::Success => {}
            State::Fail | State::Undecided => {
                println!("------------------------------------------------------------------");
                println!("Test not successful ({state:?}) after {i} iterations");
                return state;
            }
        }
    }
    println!("------------------------------------------------------------------");
    println!("Test successful after {times} iterations");
    State::Success
}

pub fn local_address() -> SocketAddr {
    "127.0.0.1:0".parse().expect("could not parse local address")
}

/// one group with one server per entry of `conns`, listening on free ports
pub fn failover_config(conns: &[usize], mode: FaultMode, rounds: usize, seed: Option<u64>) -> Config {
    let servers = conns
        .iter()
        .map(|conns_n| ServerSpec {
            address: local_address(),
            conns_n: *conns_n,
        })
        .collect::<Vec<_>>();
    let groups = if servers.is_empty() {
        Vec::new()
    } else {
        vec![GroupSpec {
            name: "default".to_owned(),
            servers,
        }]
    };
    Config {
        fault_mode: mode,
        rounds,
        seed,
        groups,
        ..Config::default()
    }
}

pub fn run_scenario<C: ProxyController>(
    config: Config,
    proxy: C,
) -> Result<ScenarioReport, ScenarioError> {
    setup_default_logging(true, "info", "E2E");
    let mut orchestrator = Orchestrator::new(config, proxy)?;
    orchestrator.run()
}

/// Failover scenario against the reference pool proxy. Checks the counts of
/// every stage, not only the final outcome.
pub fn try_failover(conns: &[usize], mode: FaultMode, rounds: usize) -> State {
    let config = failover_config(conns, mode, rounds, None);
    let expected: usize = conns.iter().sum();
    let batch = expected / 4;

    let report = match run_scenario(config, PoolProxy::new("POOL")) {
        Ok(report) => report,
        Err(error) => {
            println!("failover scenario failed: {error}");
            return State::Fail;
        }
    };

    println!(
        "expected {}, baseline in {:?}, recovery {}",
        report.expected, report.baseline, report.recovery
    );
    if report.expected != expected || report.rounds.len() != rounds {
        return State::Fail;
    }
    for round in &report.rounds {
        if round.fault.mode != mode
            || round.fault.batch_size != batch
            || round.fault.terminated.len() != batch
            || round.degraded != expected - batch
        {
            println!("unexpected round: {round:?}");
            return State::Fail;
        }
    }
    if report.per_server.values().sum::<usize>() != expected {
        return State::Fail;
    }
    State::Success
}

mod cli;
mod command_controller;

use std::{path::Path, process};

use anyhow::Context;
use clap::Parser;

use failover_command_lib::{
    config::{Config, FileConfig},
    error, info,
    logging::setup_logging,
};
use failover_lib::{
    controller::{NoopController, ProxyController},
    orchestrator::{Orchestrator, ScenarioReport},
};

use crate::{
    cli::{Args, SubCmd},
    command_controller::CommandController,
};

fn main() {
    let args = Args::parse();

    let result = match args.cmd {
        SubCmd::Run {
            config,
            mode,
            rounds,
            seed,
            proxy_command,
        } => run(&config, mode, rounds, seed, proxy_command),
        SubCmd::CheckConfig { config } => check_config(&config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("failover: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    FileConfig::load_from_path(path)
        .and_then(FileConfig::into_config)
        .with_context(|| format!("invalid configuration {}", path.display()))
}

fn run(
    config_path: &Path,
    mode: Option<failover_command_lib::config::FaultMode>,
    rounds: Option<usize>,
    seed: Option<u64>,
    proxy_command: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mode) = mode {
        config.fault_mode = mode;
    }
    if let Some(rounds) = rounds {
        anyhow::ensure!(rounds > 0, "rounds must be at least 1");
        config.rounds = rounds;
    }
    if seed.is_some() {
        config.seed = seed;
    }

    setup_logging(&config.log_target, &config.log_level, "FAILOVER")
        .context("could not set up logging")?;
    info!(
        "{} fault, {} rounds, {} backend connections expected",
        config.fault_mode,
        config.rounds,
        config.expected_conns_n()
    );

    let report = if proxy_command.is_empty() {
        run_with(config, NoopController::default())?
    } else {
        run_with(config, CommandController::new(proxy_command)?)?
    };
    print_report(&report);
    Ok(())
}

fn run_with<C: ProxyController>(config: Config, controller: C) -> anyhow::Result<ScenarioReport> {
    let mut orchestrator =
        Orchestrator::new(config, controller).context("could not set up the harness")?;
    let report = orchestrator.run().context("failover scenario failed")?;
    Ok(report)
}

fn print_report(report: &ScenarioReport) {
    println!(
        "pool of {} backend connections reached in {:?}",
        report.expected, report.baseline
    );
    for (index, round) in report.rounds.iter().enumerate() {
        println!(
            "round {}: {} of {} connections ({} left), restored in {:?}",
            index,
            round.fault.mode,
            round.fault.terminated.len(),
            round.degraded,
            round.recovery
        );
    }
    println!("recovery: {}", report.recovery);
    println!(
        "accepted {} connections, {} closed by the proxy, {} transport errors",
        report.loop_stats.accepted, report.loop_stats.peer_closed, report.loop_stats.transport_errors
    );
    for (server, count) in &report.per_server {
        println!("  {server}: {count}");
    }
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    for group in &config.groups {
        for server in &group.servers {
            println!("{}: {} x{}", group.name, server.address, server.conns_n);
        }
    }
    println!(
        "{} backend connections expected, {} per fault batch",
        config.expected_conns_n(),
        config.expected_conns_n() / 4
    );
    Ok(())
}

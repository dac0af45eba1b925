use std::path::PathBuf;

use clap::{Parser, Subcommand};

use failover_command_lib::config::FaultMode;

#[derive(Parser, PartialEq, Eq, Clone, Debug)]
#[command(
    name = "failover",
    version,
    about = "checks that a proxy restores its backend connection pool after faults"
)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, PartialEq, Eq, Clone, Debug)]
pub enum SubCmd {
    #[command(about = "play the backends of a proxy, terminate some connections, wait for the pool to come back")]
    Run {
        #[arg(short = 'c', long = "config", help = "path to the harness configuration file")]
        config: PathBuf,
        #[arg(long = "mode", help = "how to terminate connections: close or shutdown")]
        mode: Option<FaultMode>,
        #[arg(long = "rounds", help = "number of fault rounds")]
        rounds: Option<usize>,
        #[arg(long = "seed", help = "seed for the choice of terminated connections")]
        seed: Option<u64>,
        #[arg(
            last = true,
            help = "command starting the proxy, it receives the backends in FAILOVER_BACKENDS. Without it, the proxy must already be running"
        )]
        proxy_command: Vec<String>,
    },
    #[command(about = "validate a configuration file and print the expected pool")]
    CheckConfig {
        #[arg(short = 'c', long = "config", help = "path to the harness configuration file")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_proxy_command() {
        let args = Args::try_parse_from([
            "failover",
            "run",
            "-c",
            "harness.toml",
            "--mode",
            "shutdown",
            "--rounds",
            "3",
            "--",
            "./proxy",
            "--workers",
            "1",
        ])
        .expect("could not parse arguments");

        assert_eq!(
            args.cmd,
            SubCmd::Run {
                config: PathBuf::from("harness.toml"),
                mode: Some(FaultMode::Shutdown),
                rounds: Some(3),
                seed: None,
                proxy_command: vec!["./proxy".into(), "--workers".into(), "1".into()],
            }
        );
    }

    #[test]
    fn reject_unknown_mode() {
        assert!(Args::try_parse_from(["failover", "run", "-c", "x.toml", "--mode", "reset"]).is_err());
    }
}

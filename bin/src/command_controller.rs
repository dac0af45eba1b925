//! Drives a proxy started as a child process

use std::{
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use failover_command_lib::{config::GroupSpec, info, warn};
use failover_lib::controller::{ControllerError, ProxyController};

/// environment variable carrying the backend list to the proxy command
pub const BACKENDS_ENV: &str = "FAILOVER_BACKENDS";
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// `group=address*conns_n,address*conns_n;group=...`
pub fn backends_env(groups: &[GroupSpec]) -> String {
    groups
        .iter()
        .map(|group| {
            let servers = group
                .servers
                .iter()
                .map(|server| format!("{}*{}", server.address, server.conns_n))
                .collect::<Vec<_>>()
                .join(",");
            format!("{}={}", group.name, servers)
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub struct CommandController {
    program: String,
    args: Vec<String>,
    backends: Option<String>,
    child: Option<Child>,
}

impl CommandController {
    pub fn new(command: Vec<String>) -> Result<Self, ControllerError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| ControllerError::Start("empty proxy command".to_owned()))?;
        Ok(CommandController {
            program,
            args: parts.collect(),
            backends: None,
            child: None,
        })
    }
}

impl ProxyController for CommandController {
    fn configure(&mut self, groups: &[GroupSpec]) -> Result<(), ControllerError> {
        if self.child.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }
        self.backends = Some(backends_env(groups));
        Ok(())
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        if self.child.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }
        let backends = self.backends.as_ref().ok_or(ControllerError::NotConfigured)?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .env(BACKENDS_ENV, backends)
            .spawn()
            .map_err(|error| ControllerError::Start(format!("{}: {}", self.program, error)))?;
        info!("started proxy {} (pid {})", self.program, child.id());
        self.child = Some(child);
        Ok(())
    }

    /// SIGTERM, then SIGKILL if the proxy is still alive after a grace period
    fn stop(&mut self) -> Result<(), ControllerError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = Pid::from_raw(child.id() as i32);
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            warn!("could not send SIGTERM to {}: {}", pid, errno);
        }

        let deadline = Instant::now() + STOP_GRACE_PERIOD;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                info!("proxy exited with {}", status);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }

        warn!("proxy {} still running, killing it", pid);
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

impl Drop for CommandController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use failover_command_lib::config::ServerSpec;

    use super::*;

    #[test]
    fn format_backends() {
        let groups = vec![
            GroupSpec {
                name: "main".to_owned(),
                servers: vec![
                    ServerSpec {
                        address: "127.0.0.1:4000".parse().unwrap(),
                        conns_n: 4,
                    },
                    ServerSpec {
                        address: "127.0.0.1:4001".parse().unwrap(),
                        conns_n: 2,
                    },
                ],
            },
            GroupSpec {
                name: "spare".to_owned(),
                servers: vec![ServerSpec {
                    address: "[::1]:4002".parse().unwrap(),
                    conns_n: 1,
                }],
            },
        ];

        assert_eq!(
            backends_env(&groups),
            "main=127.0.0.1:4000*4,127.0.0.1:4001*2;spare=[::1]:4002*1"
        );
    }

    #[test]
    fn empty_command_is_refused() {
        assert!(matches!(
            CommandController::new(Vec::new()),
            Err(ControllerError::Start(_))
        ));
    }

    #[test]
    fn start_then_stop_a_process() {
        let mut controller =
            CommandController::new(vec!["sleep".to_owned(), "30".to_owned()]).expect("valid command");
        assert!(matches!(controller.start(), Err(ControllerError::NotConfigured)));

        controller.configure(&[]).expect("could not configure");
        controller.start().expect("could not start sleep");
        let started = Instant::now();
        controller.stop().expect("could not stop sleep");
        assert!(started.elapsed() < STOP_GRACE_PERIOD);
    }
}

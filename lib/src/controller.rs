//! The proxy under test, as seen by the harness

use failover_command_lib::{config::GroupSpec, info};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("the proxy was started before being configured")]
    NotConfigured,
    #[error("the proxy is already running")]
    AlreadyRunning,
    #[error("could not start the proxy: {0}")]
    Start(String),
    #[error("could not stop the proxy: {0}")]
    Stop(String),
    #[error("I/O error while driving the proxy: {0}")]
    Io(#[from] std::io::Error),
}

/// Configures, starts and stops the proxy. `configure` receives the backend
/// groups with the addresses the harness actually listens on.
pub trait ProxyController {
    fn configure(&mut self, groups: &[GroupSpec]) -> Result<(), ControllerError>;
    fn start(&mut self) -> Result<(), ControllerError>;
    fn stop(&mut self) -> Result<(), ControllerError>;
}

impl<C: ProxyController + ?Sized> ProxyController for Box<C> {
    fn configure(&mut self, groups: &[GroupSpec]) -> Result<(), ControllerError> {
        (**self).configure(groups)
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), ControllerError> {
        (**self).stop()
    }
}

/// For a proxy managed outside of the harness, already configured to
/// connect to the harness listeners
#[derive(Debug, Default)]
pub struct NoopController {
    pub groups: Vec<GroupSpec>,
    pub running: bool,
}

impl ProxyController for NoopController {
    fn configure(&mut self, groups: &[GroupSpec]) -> Result<(), ControllerError> {
        for group in groups {
            for server in &group.servers {
                info!(
                    "expecting {} connections from the proxy on {} ({})",
                    server.conns_n, server.address, group.name
                );
            }
        }
        self.groups = groups.to_vec();
        Ok(())
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ControllerError> {
        self.running = false;
        Ok(())
    }
}

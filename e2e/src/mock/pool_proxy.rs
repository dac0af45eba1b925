use std::{
    io::{ErrorKind, Read},
    net::{SocketAddr, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use futures::channel::mpsc;

use failover_command_lib::{config::GroupSpec, debug, info};
use failover_lib::controller::{ControllerError, ProxyController};

use crate::BUFFER_SIZE;

/// Delays between reconnection attempts, in milliseconds. The first retry
/// is almost immediate, then backs off up to one second and stays there.
pub const RECONNECT_DELAYS_MS: [u64; 6] = [1, 10, 100, 250, 500, 1000];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const TICK: Duration = Duration::from_millis(1);

pub fn reconnect_delay(attempts: usize) -> Duration {
    let index = attempts.min(RECONNECT_DELAYS_MS.len() - 1);
    Duration::from_millis(RECONNECT_DELAYS_MS[index])
}

/// What the proxy thread did during its life
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connects: usize,
    pub failed_attempts: usize,
    /// connections found closed or reset by the backend
    pub lost: usize,
}

/// One connection the proxy keeps to a backend server
struct Slot {
    address: SocketAddr,
    stream: Option<TcpStream>,
    /// connected at least once
    opened: bool,
    attempts: usize,
    retry_at: Instant,
}

impl Slot {
    fn new(address: SocketAddr) -> Self {
        Slot {
            address,
            stream: None,
            opened: false,
            attempts: 0,
            retry_at: Instant::now(),
        }
    }

    /// returns false when the backend closed or reset the connection
    fn is_alive(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => return true,
                    ErrorKind::Interrupted => continue,
                    _ => return false,
                },
            }
        }
    }

    fn connect(&mut self, name: &str, stats: &mut PoolStats) {
        let attempt =
            TcpStream::connect_timeout(&self.address, CONNECT_TIMEOUT).and_then(|stream| {
                stream.set_nonblocking(true)?;
                Ok(stream)
            });
        match attempt {
            Ok(stream) => {
                self.stream = Some(stream);
                self.opened = true;
                self.attempts = 0;
                stats.connects += 1;
            }
            Err(error) => {
                debug!("{}: cannot connect to {}: {}", name, self.address, error);
                self.attempts += 1;
                self.retry_at = Instant::now() + reconnect_delay(self.attempts);
                stats.failed_attempts += 1;
            }
        }
    }

    fn tick(&mut self, name: &str, failover: bool, stats: &mut PoolStats) {
        match self.stream.as_mut() {
            Some(stream) => {
                if !Slot::is_alive(stream) {
                    debug!("{}: lost connection to {}", name, self.address);
                    self.stream = None;
                    self.attempts = 0;
                    self.retry_at = Instant::now() + reconnect_delay(0);
                    stats.lost += 1;
                }
            }
            None if failover || !self.opened => {
                if Instant::now() >= self.retry_at {
                    self.connect(name, stats);
                }
            }
            None => {}
        }
    }
}

/// Handle to a detached thread behaving like a proxy toward its backends:
/// it keeps `conns_n` connections open to every configured server and,
/// with failover enabled, replaces the ones the backends terminate.
pub struct PoolProxy {
    pub name: String,
    failover: bool,
    groups: Option<Vec<GroupSpec>>,
    /// Allows to stop the proxy within the thread
    stop_tx: Option<mpsc::Sender<()>>,
    /// Receives the stats from the thread when it stops
    stats_rx: Option<mpsc::Receiver<PoolStats>>,
    thread: Option<JoinHandle<()>>,
    stats: Option<PoolStats>,
}

impl PoolProxy {
    pub fn new<S: Into<String>>(name: S) -> Self {
        PoolProxy::with_failover(name, true)
    }

    /// a proxy that opens its pool once and never replaces lost connections
    pub fn without_failover<S: Into<String>>(name: S) -> Self {
        PoolProxy::with_failover(name, false)
    }

    fn with_failover<S: Into<String>>(name: S, failover: bool) -> Self {
        PoolProxy {
            name: name.into(),
            failover,
            groups: None,
            stop_tx: None,
            stats_rx: None,
            thread: None,
            stats: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// stats of the last run, once stopped
    pub fn stats(&self) -> Option<PoolStats> {
        self.stats
    }
}

impl ProxyController for PoolProxy {
    fn configure(&mut self, groups: &[GroupSpec]) -> Result<(), ControllerError> {
        if self.is_running() {
            return Err(ControllerError::AlreadyRunning);
        }
        self.groups = Some(groups.to_vec());
        Ok(())
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        if self.is_running() {
            return Err(ControllerError::AlreadyRunning);
        }
        let groups = self.groups.as_ref().ok_or(ControllerError::NotConfigured)?;

        let mut slots = Vec::new();
        for group in groups {
            for server in &group.servers {
                slots.extend((0..server.conns_n).map(|_| Slot::new(server.address)));
            }
        }

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut stats_tx, stats_rx) = mpsc::channel::<PoolStats>(1);
        let thread_name = self.name.to_owned();
        let failover = self.failover;

        // The proxy runs on this detached thread:
        // - opens every slot, retrying with backoff
        // - watches open slots for close or reset
        // - monitors stop_rx to stop itself
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut stats = PoolStats::default();
                info!("{}: opening {} backend connections", thread_name, slots.len());
                loop {
                    for slot in slots.iter_mut() {
                        slot.tick(&thread_name, failover, &mut stats);
                    }
                    match stop_rx.try_next() {
                        Ok(Some(_)) => break,
                        _ => thread::sleep(TICK),
                    }
                }
                drop(slots);
                info!("{}: stopped, {:?}", thread_name, stats);
                let _ = stats_tx.try_send(stats);
            })
            .map_err(|error| ControllerError::Start(error.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.stats_rx = Some(stats_rx);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ControllerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Some(mut stop_tx) = self.stop_tx.take() {
            stop_tx
                .try_send(())
                .map_err(|error| ControllerError::Stop(error.to_string()))?;
        }
        thread
            .join()
            .map_err(|_| ControllerError::Stop(format!("{} thread panicked", self.name)))?;
        if let Some(mut stats_rx) = self.stats_rx.take() {
            if let Ok(Some(stats)) = stats_rx.try_next() {
                self.stats = Some(stats);
            }
        }
        Ok(())
    }
}

impl Drop for PoolProxy {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use failover_command_lib::config::ServerSpec;

    use super::*;

    #[test]
    fn backoff_schedule() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1));
        assert_eq!(reconnect_delay(2), Duration::from_millis(100));
        assert_eq!(reconnect_delay(5), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn start_requires_configuration() {
        let mut proxy = PoolProxy::new("unconfigured");
        assert!(matches!(proxy.start(), Err(ControllerError::NotConfigured)));
        assert!(proxy.stop().is_ok());
    }

    #[test]
    fn reopens_a_lost_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind");
        let address = listener.local_addr().expect("no address");

        let mut proxy = PoolProxy::new("POOL");
        proxy
            .configure(&[GroupSpec {
                name: "main".to_owned(),
                servers: vec![ServerSpec { address, conns_n: 1 }],
            }])
            .expect("could not configure");
        proxy.start().expect("could not start");
        assert!(matches!(proxy.start(), Err(ControllerError::AlreadyRunning)));

        let (first, _) = listener.accept().expect("could not accept");
        drop(first);
        let (_second, _) = listener.accept().expect("the proxy should reconnect");

        proxy.stop().expect("could not stop");
        let stats = proxy.stats().expect("stats should be sent on stop");
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.lost, 1);
    }

    #[test]
    fn does_not_reopen_without_failover() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind");
        let address = listener.local_addr().expect("no address");

        let mut proxy = PoolProxy::without_failover("NO_FAILOVER");
        proxy
            .configure(&[GroupSpec {
                name: "main".to_owned(),
                servers: vec![ServerSpec { address, conns_n: 2 }],
            }])
            .expect("could not configure");
        proxy.start().expect("could not start");

        let (first, _) = listener.accept().expect("could not accept");
        let (_second, _) = listener.accept().expect("both slots should open once");
        drop(first);

        listener
            .set_nonblocking(true)
            .expect("could not set non blocking");
        thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            listener.accept(),
            Err(error) if error.kind() == ErrorKind::WouldBlock
        ));

        proxy.stop().expect("could not stop");
        let stats = proxy.stats().expect("stats should be sent on stop");
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.lost, 1);
    }
}

//! TCP port reachability polling.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Desired state of a TCP port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortState {
    /// The port accepts connections.
    Open,
    /// The port refuses connections or the host is unreachable.
    Closed,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Errors raised while waiting on a port.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PortError {
    /// The port did not reach the desired state before the deadline.
    #[error("timed out waiting for {host}:{port} to become {state}")]
    Timeout {
        /// Host being polled.
        host: String,
        /// Port being polled.
        port: u16,
        /// State that was never reached.
        state: PortState,
    },
}

/// Waits for a port to open or close.
pub trait PortProbe: Send + Sync {
    /// Blocks until `host:port` reaches `want`, calling `on_progress` after
    /// every unsuccessful attempt.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Timeout`] when the implementation bounds the wait
    /// and the deadline passes.
    fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        want: PortState,
        on_progress: &mut dyn FnMut(),
    ) -> Result<(), PortError>;
}

/// Polls a port with blocking TCP connects.
///
/// Waits indefinitely unless a deadline is configured.
#[derive(Clone, Debug)]
pub struct TcpPortProbe {
    poll_interval: Duration,
    connect_timeout: Duration,
    wait_timeout: Option<Duration>,
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            wait_timeout: None,
        }
    }
}

impl TcpPortProbe {
    /// Creates a probe with one-second polling and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds the overall wait.
    #[must_use]
    pub const fn with_wait_timeout(mut self, limit: Duration) -> Self {
        self.wait_timeout = Some(limit);
        self
    }

    fn current_state(&self, host: &str, port: u16) -> PortState {
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return PortState::Closed;
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok() {
                return PortState::Open;
            }
        }
        PortState::Closed
    }
}

impl PortProbe for TcpPortProbe {
    fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        want: PortState,
        on_progress: &mut dyn FnMut(),
    ) -> Result<(), PortError> {
        let deadline = self.wait_timeout.map(|limit| Instant::now() + limit);
        loop {
            if self.current_state(host, port) == want {
                return Ok(());
            }
            on_progress();
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Err(PortError::Timeout {
                    host: host.to_owned(),
                    port,
                    state: want,
                });
            }
            debug!(host, port, %want, "port not yet in desired state");
            thread::sleep(self.poll_interval);
        }
    }
}

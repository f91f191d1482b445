//! Lifecycle and access controller
//!
//! Drives the external transport through `Stopped -> Starting -> Listening
//! -> Stopping -> Stopped`. Sync events are only taken while accepting, and
//! `stop` waits for every event already handed to the engine.

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::index::{Decision, Observation};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// The network listener in front of the engine
pub trait Transport: Send + Sync + 'static {
    /// Bind the listening sockets
    fn start(&self, config: &ServerConfig) -> Result<()>;

    /// Begin handing client connections to the server
    fn accept(&self) -> Result<()>;

    /// Stop accepting new clients
    fn shutdown(&self) -> Result<()>;
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    /// Transport is up but sync events are not yet accepted
    Listening,
    /// Listening and accepting sync events
    Accepting,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Listening => "listening",
            ServerState::Accepting => "accepting",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Count of events being committed, with a wakeup when it drops to zero
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Sync server lifecycle over a transport
pub struct Server<T: Transport> {
    engine: Arc<Engine>,
    transport: T,
    state: Mutex<ServerState>,
    in_flight: Arc<InFlight>,
}

impl<T: Transport> Server<T> {
    pub fn new(engine: Arc<Engine>, transport: T) -> Self {
        Server {
            engine,
            transport,
            state: Mutex::new(ServerState::Stopped),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Events currently being committed
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Bring the transport up
    pub fn start(&self) -> Result<()> {
        self.transition("start", &[ServerState::Stopped], ServerState::Starting)?;

        match self.transport.start(&self.engine.config().server) {
            Ok(()) => {
                *self.state.lock() = ServerState::Listening;
                let server = &self.engine.config().server;
                info!(
                    "Listening on {} (ports {}, {})",
                    server.address, server.port, server.port3
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ServerState::Stopped;
                warn!("Start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Begin accepting sync events. A no-op when already accepting.
    pub fn listen(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ServerState::Listening => {
                self.transport.accept()?;
                *state = ServerState::Accepting;
                info!("Accepting sync events");
                Ok(())
            }
            ServerState::Accepting => Ok(()),
            other => Err(Error::InvalidState {
                operation: "listen",
                state: other.to_string(),
            }),
        }
    }

    /// Stop taking clients, wait for in-flight events and flush the store.
    ///
    /// The server ends up stopped either way; a transport shutdown error is
    /// returned once the store has been flushed.
    pub async fn stop(&self) -> Result<()> {
        self.transition(
            "stop",
            &[ServerState::Listening, ServerState::Accepting],
            ServerState::Stopping,
        )?;

        let shutdown = self.transport.shutdown();
        if let Err(e) = &shutdown {
            warn!("Transport shutdown failed: {}", e);
        }

        loop {
            let idle = self.in_flight.idle.notified();
            let pending = self.in_flight();
            if pending == 0 {
                break;
            }
            debug!("Waiting for {} in-flight events", pending);
            idle.await;
        }

        let flushed = self.engine.flush();
        *self.state.lock() = ServerState::Stopped;
        info!("Stopped");
        shutdown.and(flushed)
    }

    /// Commit one sync event on the blocking pool.
    ///
    /// Dropping the returned future does not cancel the commit; it either
    /// lands whole or not at all, and `stop` still waits for it.
    pub async fn submit(&self, event: Observation) -> Result<Decision> {
        let guard = {
            let state = self.state.lock();
            if *state != ServerState::Accepting {
                return Err(Error::InvalidState {
                    operation: "submit",
                    state: state.to_string(),
                });
            }
            self.in_flight.count.fetch_add(1, Ordering::AcqRel);
            InFlightGuard(self.in_flight.clone())
        };

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            engine.record_event(event)
        })
        .await
        .map_err(|e| Error::Internal(format!("sync task failed: {}", e)))?
    }

    /// Rotate a root password. Valid in every state.
    pub fn set_password(&self, root: &str, password: &str) -> Result<u64> {
        self.engine.directories().set_password(root, password)
    }

    /// Reset a root password. Valid in every state.
    pub fn reset_password(&self, root: &str) -> Result<Zeroizing<String>> {
        self.engine.directories().reset_password(root)
    }

    fn transition(
        &self,
        operation: &'static str,
        from: &[ServerState],
        to: ServerState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(Error::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        debug!("{} -> {}", *state, to);
        *state = to;
        Ok(())
    }
}

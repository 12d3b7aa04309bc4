//! Send-side worker thread.
//!
//! [`Worker`] bundles what the dispatch thread will own: a decoder, a ready
//! destination socket, and the identifier used in log lines. Setup happens on
//! the caller's thread so that configuration and socket errors come back from
//! [`Worker::spawn`] instead of disappearing into the thread.
//!
//! Once started, the thread owns a [`WorkerContext`]. Dropping the context is
//! the only teardown path: it clears the running flag and closes the socket,
//! whether the loop returned or unwound. `exit socket thread` is logged only
//! for a context whose loop actually ran.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::config::{BridgeConfig, ConfigError};
use crate::envelope::{AmqpDecoder, EnvelopeDecoder};
use crate::net::{DatagramSink, DestinationSocket, SetupError};
use crate::queue::EnvelopeSource;
use crate::trace::{debug, error, info, warn};

use super::dispatch::{DispatchExit, Dispatcher};
use super::stats::WorkerStats;

/// Name of the dispatch thread.
pub const THREAD_NAME: &str = "sgbridge-snd";

/// Error starting or joining a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("destination setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("dispatch thread panicked")]
    Panicked,
}

/// A worker that has been set up but not started.
pub struct Worker<D, K> {
    id: String,
    decoder: D,
    sink: K,
}

impl Worker<AmqpDecoder, DestinationSocket> {
    /// Validates `config` and opens the destination socket.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Config`] if the domain tag or a required field is bad,
    /// [`WorkerError::Setup`] if the socket or address cannot be prepared.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, WorkerError> {
        let destination = config.destination().inspect_err(|_e| {
            error!(id = %config.container_id, error = %_e, "invalid bridge configuration");
        })?;
        let socket = destination.setup(&config.container_id, config.send_flags())?;
        Ok(Self::new(
            config.container_id.clone(),
            AmqpDecoder::new(),
            socket,
        ))
    }

    /// Sets up from `config` and starts the dispatch thread.
    ///
    /// # Errors
    ///
    /// See [`Worker::from_config`] and [`Worker::start`].
    pub fn spawn<S>(
        config: &BridgeConfig,
        source: S,
        cancel: CancelToken,
    ) -> Result<WorkerHandle, WorkerError>
    where
        S: EnvelopeSource + Send + 'static,
    {
        Self::from_config(config)?.start(source, cancel)
    }

    /// The socket the thread will send on, for tuning before start.
    #[must_use]
    pub fn socket(&self) -> &DestinationSocket {
        &self.sink
    }
}

impl<D, K> Worker<D, K>
where
    D: EnvelopeDecoder + Send + 'static,
    K: DatagramSink + Send + 'static,
{
    pub fn new(id: impl Into<String>, decoder: D, sink: K) -> Self {
        Self {
            id: id.into(),
            decoder,
            sink,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the dispatch thread reading from `source` until `cancel` fires,
    /// the source disconnects, or a send fails fatally.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Spawn`] if the OS refuses the thread. The socket is
    /// closed in that case.
    pub fn start<S>(self, source: S, cancel: CancelToken) -> Result<WorkerHandle, WorkerError>
    where
        S: EnvelopeSource + Send + 'static,
    {
        let stats = Arc::new(WorkerStats::new());
        let dispatcher = Dispatcher::new(self.decoder, self.sink, Arc::clone(&stats));
        let mut context = WorkerContext::new(self.id.clone(), dispatcher);

        debug!(id = %self.id, "spawning socket thread");
        let thread_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                let mut source = source;
                context.run(&mut source, &thread_cancel)
            })
            .map_err(|e| {
                error!(id = %self.id, error = %e, "failed to spawn socket thread");
                WorkerError::Spawn(e)
            })?;

        Ok(WorkerHandle {
            id: self.id,
            cancel,
            stats,
            thread: Some(thread),
        })
    }
}

/// State owned by the dispatch thread. Its drop is the teardown.
struct WorkerContext<D: EnvelopeDecoder, K: DatagramSink> {
    id: String,
    stats: Arc<WorkerStats>,
    dispatcher: Option<Dispatcher<D, K>>,
    /// Set once the loop has been entered.
    started: bool,
}

impl<D: EnvelopeDecoder, K: DatagramSink> WorkerContext<D, K> {
    fn new(id: String, dispatcher: Dispatcher<D, K>) -> Self {
        Self {
            id,
            stats: Arc::clone(dispatcher.stats()),
            dispatcher: Some(dispatcher),
            started: false,
        }
    }

    fn run(&mut self, source: &mut impl EnvelopeSource, cancel: &CancelToken) -> DispatchExit {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return DispatchExit::Disconnected;
        };

        self.started = true;
        self.stats.set_running(true);
        info!(id = %self.id, "socket thread started");

        let exit = dispatcher.run(source, cancel);
        match exit {
            DispatchExit::Cancelled => debug!(id = %self.id, "socket thread cancelled"),
            DispatchExit::Disconnected => debug!(id = %self.id, "inbound queue disconnected"),
            DispatchExit::Fatal(_e) => {
                error!(id = %self.id, error = %_e, "socket thread stopping on send failure");
            }
        }
        exit
    }
}

impl<D: EnvelopeDecoder, K: DatagramSink> Drop for WorkerContext<D, K> {
    fn drop(&mut self) {
        self.stats.set_running(false);
        // Dropping the dispatcher closes the socket.
        drop(self.dispatcher.take());
        if !self.started {
            debug!(id = %self.id, "socket closed before the thread ran");
            return;
        }
        if thread::panicking() {
            warn!(id = %self.id, "socket thread unwinding");
        }
        info!(id = %self.id, stats = %self.stats.snapshot(), "exit socket thread");
    }
}

/// Handle to a running worker.
///
/// Dropping the handle signals cancellation but does not wait for the thread.
/// Use [`WorkerHandle::shutdown`] to stop and join.
pub struct WorkerHandle {
    id: String,
    cancel: CancelToken,
    stats: Arc<WorkerStats>,
    thread: Option<JoinHandle<DispatchExit>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stats.is_running()
    }

    /// Whether the thread has returned, by any path.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cancels the worker and waits for it.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Panicked`] if the thread panicked.
    pub fn shutdown(self) -> Result<DispatchExit, WorkerError> {
        info!(id = %self.id, "socket thread shutdown requested");
        self.cancel.cancel();
        self.join()
    }

    /// Waits for the worker to stop on its own.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Panicked`] if the thread panicked.
    pub fn join(mut self) -> Result<DispatchExit, WorkerError> {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(exit)) => Ok(exit),
            _ => Err(WorkerError::Panicked),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

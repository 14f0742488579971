//! Connection manager: owns one broker channel on a dedicated background thread
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (loss) Disconnected -> Connecting ...
//!                                   stop(): Closing -> Disconnected
//! ```
//!
//! The background thread runs a single-threaded tokio runtime. While connected
//! it drives a [`Session`] (the publisher's drain loop or the subscriber's
//! consume loop). When the session ends or the broker closes the channel,
//! even while the session is idle, it waits a fixed interval and reconnects,
//! indefinitely, until `stop()`.

use crate::broker::{Broker, BrokerChannel, DeliveryStream};
use crate::error::{EiffelError, Result};
use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Work performed while a channel is live
///
/// `run` is called after every successful connect. Returning (with or
/// without an error) ends the session; the manager then reconnects.
#[async_trait]
pub trait Session: Send + Sync {
    async fn run(&self, connection: &ConnectionManager) -> Result<()>;
}

/// Owns a broker connection/channel and keeps it alive
pub struct ConnectionManager {
    name: String,
    broker: Arc<dyn Broker>,
    reconnect_interval: Mutex<Duration>,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    /// Create a manager; nothing connects until [`start`](Self::start)
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            broker,
            reconnect_interval: Mutex::new(DEFAULT_RECONNECT_INTERVAL),
            state: Mutex::new(ConnectionState::Disconnected),
            state_changed: Condvar::new(),
            channel: RwLock::new(None),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker_name(&self) -> &str {
        self.broker.name()
    }

    /// Change the fixed delay between reconnect attempts
    ///
    /// Applies from the next (re)start.
    pub fn set_reconnect_interval(&self, interval: Duration) {
        *lock(&self.reconnect_interval) = interval;
    }

    pub fn reconnect_interval(&self) -> Duration {
        *lock(&self.reconnect_interval)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Block until the state equals `target` or the timeout elapses
    ///
    /// Returns whether the target state was observed.
    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let guard = lock(&self.state);
        let (guard, _) = self
            .state_changed
            .wait_timeout_while(guard, timeout, |state| *state != target)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == target
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        let previous = *state;
        if previous != next {
            tracing::debug!(connection = %self.name, from = %previous, to = %next, "Connection state changed");
            *state = next;
            self.state_changed.notify_all();
        }
    }

    /// State change requested by the background loop; ignored once stopping
    fn transition(&self, next: ConnectionState) {
        if !*self.shutdown.borrow() {
            self.set_state(next);
        }
    }

    /// Start the background thread (non-blocking, idempotent)
    pub fn start(self: &Arc<Self>, session: Arc<dyn Session>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        self.shutdown.send_replace(false);
        self.set_state(ConnectionState::Connecting);

        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("eiffel-{}", self.name))
            .spawn(move || manager.run_worker(session))
            .map_err(|e| {
                self.set_state(ConnectionState::Disconnected);
                EiffelError::Connection(format!("Failed to spawn connection thread: {e}"))
            })?;
        *worker = Some(handle);

        tracing::info!(connection = %self.name, broker = %self.broker.name(), "Connection manager started");
        Ok(())
    }

    /// Stop the background thread and release the connection (idempotent)
    ///
    /// Does not interrupt a callback already running on the background thread;
    /// waits for it to return unless called from that thread.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };

        self.set_state(ConnectionState::Closing);
        self.shutdown.send_replace(true);

        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            tracing::error!(connection = %self.name, "Connection thread panicked");
        }

        if let Ok(mut channel) = self.channel.write() {
            channel.take();
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(connection = %self.name, "Connection manager stopped");
    }

    fn run_worker(self: Arc<Self>, session: Arc<dyn Session>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(connection = %self.name, error = %e, "Failed to build runtime");
                self.transition(ConnectionState::Disconnected);
                return;
            }
        };
        runtime.block_on(self.run_loop(session));
    }

    async fn run_loop(&self, session: Arc<dyn Session>) {
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.reconnect_interval();
        let backoff_builder = ConstantBuilder::default()
            .with_delay(interval)
            .with_max_times(usize::MAX);
        let mut backoff = backoff_builder.build();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                result = self.broker.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(channel) => {
                    self.set_channel(Some(Arc::clone(&channel)));
                    self.transition(ConnectionState::Connected);
                    backoff = backoff_builder.build();
                    tracing::info!(connection = %self.name, "Connected to broker");

                    let outcome = tokio::select! {
                        result = session.run(self) => Some(result),
                        _ = channel.closed() => {
                            Some(Err(EiffelError::Connection("channel closed by broker".to_string())))
                        }
                        _ = shutdown.changed() => None,
                    };

                    self.set_channel(None);
                    if let Err(e) = channel.close().await {
                        tracing::debug!(connection = %self.name, error = %e, "Channel close failed");
                    }

                    match outcome {
                        None => break,
                        Some(Ok(())) => {
                            tracing::info!(connection = %self.name, "Session ended, reconnecting")
                        }
                        Some(Err(e)) => {
                            tracing::warn!(connection = %self.name, error = %e, "Connection lost")
                        }
                    }
                    self.transition(ConnectionState::Disconnected);
                }
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    tracing::warn!(
                        connection = %self.name,
                        error = %e,
                        retry_in_ms = interval.as_millis() as u64,
                        "Failed to connect to broker"
                    );
                }
            }

            let delay = backoff.next().unwrap_or(interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    fn set_channel(&self, channel: Option<Arc<dyn BrokerChannel>>) {
        match self.channel.write() {
            Ok(mut slot) => *slot = channel,
            Err(poisoned) => *poisoned.into_inner() = channel,
        }
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let slot = self.channel.read().unwrap_or_else(PoisonError::into_inner);
        slot.clone().ok_or(EiffelError::NotConnected)
    }

    /// Whether a live channel is held
    pub fn is_connected(&self) -> bool {
        self.channel().is_ok()
    }

    /// Publish bytes with a routing key; fails with `NotConnected` when no channel is live
    pub async fn send(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.channel()?.publish(routing_key, payload).await
    }

    /// Declare a queue on the live channel
    pub async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel()?.declare_queue(queue).await
    }

    /// Bind a queue on the live channel
    pub async fn bind(&self, queue: &str, binding_key: &str) -> Result<()> {
        self.channel()?.bind(queue, binding_key).await
    }

    /// Start consuming a queue on the live channel
    ///
    /// The stream ends when the channel is lost.
    pub async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.channel()?.consume(queue).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

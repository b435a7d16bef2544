//! Shares one physical connection per URL across many logical subscriptions.
//!
//! The registry maps URL → connection entry. Each entry holds the command
//! channel of the connection task, its state watch, and the subscriptions
//! registered on it. The subscription list is mirrored here so a connection
//! task that died (reconnect budget exhausted) can be replaced with every
//! subscription re-sent.
//!
//! Subscribers receive a [`StreamEvent`] stream instead of callbacks.
//!
//! ```text
//! open_subscription ─┐                      ┌─▶ sub A events
//! open_subscription ─┼─▶ registry[url] ─▶ task ─▶ sub B events
//! unsubscribe ───────┘                      └─▶ ...
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{ActiveSubscription, ConnCommand, ConnectionTask};
use super::reconnect::ReconnectPolicy;
use super::transport::Connector;
use crate::error::{FeedError, Result};
use crate::types::ConnectionState;

/// Predicate over a parsed inbound frame.
pub type MessageFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub reconnect: ReconnectPolicy,
    /// Client keep-alive ping period; `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// How long an explicit close may take before the task is aborted.
    pub close_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ping_interval: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything needed to register one logical subscription.
#[derive(Clone)]
pub struct SubscriptionSpec {
    pub url: String,
    /// Unique per URL.
    pub id: String,
    pub subscribe_message: String,
    /// Sent on unsubscribe if the socket is open.
    pub unsubscribe_message: Option<String>,
    /// Frames this subscription owns.
    pub message_filter: MessageFilter,
    /// Owned frames that are upstream errors.
    pub error_filter: Option<MessageFilter>,
}

impl SubscriptionSpec {
    /// A spec that receives every frame on the URL.
    pub fn new(
        url: impl Into<String>,
        id: impl Into<String>,
        subscribe_message: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            id: id.into(),
            subscribe_message: subscribe_message.into(),
            unsubscribe_message: None,
            message_filter: Arc::new(|_| true),
            error_filter: None,
        }
    }

    pub fn with_unsubscribe(mut self, message: impl Into<String>) -> Self {
        self.unsubscribe_message = Some(message.into());
        self
    }

    pub fn with_message_filter(
        mut self,
        filter: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.message_filter = Arc::new(filter);
        self
    }

    pub fn with_error_filter(
        mut self,
        filter: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("subscribe_message", &self.subscribe_message)
            .field("unsubscribe_message", &self.unsubscribe_message)
            .field("error_filter", &self.error_filter.is_some())
            .finish_non_exhaustive()
    }
}

/// What a subscription observes.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A frame that passed the message filter and not the error filter.
    Message {
        frame: Arc<Value>,
        received_at_ms: u64,
    },
    /// Upstream error frame, unparseable frame, transport error, or the fatal
    /// [`FeedError::ReconnectExhausted`].
    Error(FeedError),
    /// The socket dropped; a reconnect is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A new socket is up and the subscribe message was re-sent. Upstream
    /// sequence numbers restart from here.
    Resubscribed,
    /// The connection closed and will not reconnect on its own.
    Closed,
}

struct ConnectionEntry {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
    subscriptions: Vec<Arc<ActiveSubscription>>,
}

struct MuxInner {
    connector: Arc<dyn Connector>,
    config: MuxConfig,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
}

/// Registry of shared connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    inner: Arc<MuxInner>,
}

impl ConnectionMultiplexer {
    pub fn new(connector: Arc<dyn Connector>, config: MuxConfig) -> Self {
        let inner = MuxInner {
            connector,
            config,
            connections: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register a subscription, creating or reviving the URL's connection.
    ///
    /// The subscribe message goes out as soon as the socket is connected.
    /// Fails with [`FeedError::DuplicateSubscription`] if `spec.id` is
    /// already registered on the URL.
    pub async fn open_subscription(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sub = Arc::new(ActiveSubscription {
            id: spec.id.clone(),
            subscribe_message: spec.subscribe_message,
            unsubscribe_message: spec.unsubscribe_message,
            message_filter: spec.message_filter,
            error_filter: spec.error_filter,
            events: events_tx,
        });

        let mut connections = self.inner.connections.lock().await;
        match connections.get_mut(&spec.url) {
            Some(entry) => {
                if entry.subscriptions.iter().any(|s| s.id == spec.id) {
                    return Err(FeedError::DuplicateSubscription {
                        url: spec.url,
                        id: spec.id,
                    });
                }
                entry.subscriptions.push(Arc::clone(&sub));
                if entry.cmd_tx.send(ConnCommand::Subscribe(sub)).is_err() {
                    info!("[mux] {}: connection task gone, refreshing", spec.url);
                    self.respawn(&spec.url, entry);
                }
                debug!(
                    "[mux] {}: {} joined ({} total)",
                    spec.url,
                    spec.id,
                    entry.subscriptions.len()
                );
            }
            None => {
                info!("[mux] {}: opening connection for {}", spec.url, spec.id);
                let entry = self.spawn(&spec.url, vec![sub], false);
                connections.insert(spec.url.clone(), entry);
            }
        }
        drop(connections);

        let handle = SubscriptionHandle {
            mux: self.clone(),
            url: spec.url,
            id: spec.id,
        };
        Ok((handle, events_rx))
    }

    /// Remove one subscription. The last one on a URL closes and evicts the
    /// connection.
    async fn remove_subscription(&self, url: &str, id: &str) {
        let task = {
            let mut connections = self.inner.connections.lock().await;
            let Some(entry) = connections.get_mut(url) else {
                return;
            };
            let Some(pos) = entry.subscriptions.iter().position(|s| s.id == id) else {
                return;
            };
            entry.subscriptions.remove(pos);
            let _ = entry.cmd_tx.send(ConnCommand::Unsubscribe(id.to_string()));
            debug!("[mux] {url}: {id} left ({} remaining)", entry.subscriptions.len());
            if !entry.subscriptions.is_empty() {
                return;
            }
            let Some(entry) = connections.remove(url) else {
                return;
            };
            info!("[mux] {url}: last subscription gone, closing connection");
            let _ = entry.cmd_tx.send(ConnCommand::Close);
            entry.task
        };
        self.await_close(url, task).await;
    }

    /// Make sure the URL has a running connection. Reconnects immediately if
    /// it is idle after a server close, and replaces a task that gave up.
    /// Returns `false` if nothing is registered for the URL.
    pub async fn ensure_live(&self, url: &str) -> bool {
        let mut connections = self.inner.connections.lock().await;
        let Some(entry) = connections.get_mut(url) else {
            return false;
        };
        if entry.cmd_tx.send(ConnCommand::Refresh).is_err() {
            info!("[mux] {url}: connection task gone, refreshing");
            self.respawn(url, entry);
        }
        true
    }

    /// Current state of the URL's connection.
    pub async fn state(&self, url: &str) -> Option<ConnectionState> {
        let connections = self.inner.connections.lock().await;
        connections.get(url).map(|e| *e.state_rx.borrow())
    }

    /// Wait until the URL's connection reaches `state`.
    pub async fn wait_for_state(&self, url: &str, state: ConnectionState) -> Result<()> {
        let mut rx = {
            let connections = self.inner.connections.lock().await;
            match connections.get(url) {
                Some(entry) => entry.state_rx.clone(),
                None => return Err(FeedError::Shutdown),
            }
        };
        rx.wait_for(|s| *s == state).await.map(|_| ()).map_err(|_| FeedError::Shutdown)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn subscription_count(&self, url: &str) -> usize {
        let connections = self.inner.connections.lock().await;
        connections.get(url).map_or(0, |e| e.subscriptions.len())
    }

    /// Close every connection and wait for the tasks to finish. Remaining
    /// subscriptions receive [`StreamEvent::Closed`].
    pub async fn shutdown(&self) {
        let entries: Vec<(String, ConnectionEntry)> = {
            let mut connections = self.inner.connections.lock().await;
            connections.drain().collect()
        };
        info!("[mux] shutting down {} connections", entries.len());
        for (url, entry) in entries {
            let _ = entry.cmd_tx.send(ConnCommand::Close);
            self.await_close(&url, entry.task).await;
        }
    }

    fn spawn(
        &self,
        url: &str,
        subscriptions: Vec<Arc<ActiveSubscription>>,
        resubscribing: bool,
    ) -> ConnectionEntry {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        for sub in &subscriptions {
            let _ = cmd_tx.send(ConnCommand::Subscribe(Arc::clone(sub)));
        }
        let task = ConnectionTask::new(
            url.to_string(),
            Arc::clone(&self.inner.connector),
            self.inner.config.clone(),
            cmd_rx,
            state_tx,
        );
        let task = tokio::spawn(task.run(resubscribing));
        ConnectionEntry {
            cmd_tx,
            state_rx,
            task,
            subscriptions,
        }
    }

    /// Replace a finished connection task, keeping the registered
    /// subscriptions.
    fn respawn(&self, url: &str, entry: &mut ConnectionEntry) {
        let subscriptions = std::mem::take(&mut entry.subscriptions);
        *entry = self.spawn(url, subscriptions, true);
    }

    async fn await_close(&self, url: &str, task: JoinHandle<()>) {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.inner.config.close_timeout, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[mux] {url}: connection task failed: {e}"),
            Err(_) => {
                warn!("[mux] {url}: close timed out, aborting");
                abort.abort();
            }
        }
    }
}

/// Owner token for one registered subscription.
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct SubscriptionHandle {
    mux: ConnectionMultiplexer,
    url: String,
    id: String,
}

impl SubscriptionHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Detach from the connection, sending the unsubscribe message if the
    /// socket is open.
    pub async fn unsubscribe(self) {
        self.mux.remove_subscription(&self.url, &self.id).await;
    }
}

impl fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMultiplexer").finish_non_exhaustive()
    }
}

//! One physical connection, run as a tokio task.
//!
//! The task owns the socket halves and the list of subscriptions sharing the
//! URL. The multiplexer talks to it only through [`ConnCommand`]s, so
//! subscription changes and frame routing are serialized on one task and
//! frames reach subscribers in wire order.
//!
//! Lifecycle:
//! 1. Connect. Commands received meanwhile are queued.
//! 2. Send every subscribe message, then read, route, and ping.
//! 3. On an unclean drop or socket error, back off and go to 1. Every
//!    subscription is re-sent on the new socket.
//! 4. On a clean server close, wait until a subscribe or refresh asks for the
//!    connection again.
//! 5. On [`ConnCommand::Close`] or an exhausted reconnect budget, exit.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::multiplexer::{MessageFilter, MuxConfig, StreamEvent};
use super::reconnect::ReconnectionManager;
use super::transport::{Connector, FrameSink, FrameSource, WireFrame};
use crate::error::FeedError;
use crate::time_util;
use crate::types::ConnectionState;

/// A subscription as the connection task sees it.
pub(crate) struct ActiveSubscription {
    pub id: String,
    pub subscribe_message: String,
    pub unsubscribe_message: Option<String>,
    pub message_filter: MessageFilter,
    pub error_filter: Option<MessageFilter>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

impl ActiveSubscription {
    fn emit(&self, event: StreamEvent) {
        // receiver gone means the subscriber is tearing down
        let _ = self.events.send(event);
    }
}

pub(crate) enum ConnCommand {
    Subscribe(Arc<ActiveSubscription>),
    Unsubscribe(String),
    /// Reconnect now if the connection is down.
    Refresh,
    Close,
}

enum SessionEnd {
    /// Close command received; the sink has been closed.
    Closed,
    /// Server closed with a handshake.
    CleanClose,
    /// Socket error or unclean drop.
    Dropped(FeedError),
}

/// Outcome of waiting while the socket is down.
enum Wait {
    Reconnect,
    Exit,
}

pub(crate) struct ConnectionTask {
    url: String,
    connector: Arc<dyn Connector>,
    config: MuxConfig,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    state_tx: watch::Sender<ConnectionState>,
    subs: Vec<Arc<ActiveSubscription>>,
    backoff: ReconnectionManager,
}

impl ConnectionTask {
    pub(crate) fn new(
        url: String,
        connector: Arc<dyn Connector>,
        config: MuxConfig,
        cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let backoff = ReconnectionManager::new(url.clone(), config.reconnect);
        Self {
            url,
            connector,
            config,
            cmd_rx,
            state_tx,
            subs: Vec::new(),
            backoff,
        }
    }

    /// Run until closed or out of reconnect budget.
    ///
    /// `resubscribing` marks a task that replaces a dead one, so subscribers
    /// already registered get [`StreamEvent::Resubscribed`] on first connect.
    pub(crate) async fn run(mut self, mut resubscribing: bool) {
        // subscriptions queued before spawn are part of the first session
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if !apply_offline(&self.url, &mut self.subs, cmd) {
                self.finish_closed();
                return;
            }
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            info!("[conn {}] connecting", self.url);

            let connected = {
                let connect = self.connector.connect(&self.url);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        res = &mut connect => break Some(res),
                        cmd = self.cmd_rx.recv() => match cmd {
                            Some(cmd) => {
                                if !apply_offline(&self.url, &mut self.subs, cmd) {
                                    break None;
                                }
                            }
                            None => break None,
                        },
                    }
                }
            };

            let end = match connected {
                None => {
                    self.finish_closed();
                    return;
                }
                Some(Ok((sink, source))) => {
                    self.set_state(ConnectionState::Connected);
                    self.run_session(sink, source, resubscribing).await
                }
                Some(Err(e)) => SessionEnd::Dropped(e),
            };

            let mut announced = false;
            let wait = match end {
                SessionEnd::Closed => {
                    self.finish_closed();
                    return;
                }
                SessionEnd::CleanClose => {
                    info!("[conn {}] server closed the connection", self.url);
                    self.set_state(ConnectionState::Disconnected);
                    self.broadcast(StreamEvent::Closed);
                    announced = true;
                    self.wait_for_demand().await
                }
                SessionEnd::Dropped(err) => {
                    self.set_state(ConnectionState::Disconnected);
                    match self.backoff.next_delay(Instant::now()) {
                        Ok(delay) => {
                            let attempt = self.backoff.attempts();
                            warn!("[conn {}] {err}, reconnect #{attempt} in {delay:?}", self.url);
                            self.broadcast(StreamEvent::Error(err));
                            self.broadcast(StreamEvent::Reconnecting { attempt, delay });
                            self.sleep_backoff(delay).await
                        }
                        Err(fatal) => {
                            error!("[conn {}] {fatal}", self.url);
                            self.finish_fatal(fatal);
                            return;
                        }
                    }
                }
            };

            match wait {
                Wait::Reconnect => resubscribing = true,
                Wait::Exit if announced => {
                    self.set_state(ConnectionState::Disconnected);
                    info!("[conn {}] closed", self.url);
                    return;
                }
                Wait::Exit => {
                    self.finish_closed();
                    return;
                }
            }
        }
    }

    /// Drive one live socket until it ends.
    async fn run_session(
        &mut self,
        mut sink: Box<dyn FrameSink>,
        mut source: Box<dyn FrameSource>,
        resubscribing: bool,
    ) -> SessionEnd {
        for sub in &self.subs {
            debug!("[conn {}] subscribing {}", self.url, sub.id);
            if let Err(e) = sink.send_text(sub.subscribe_message.clone()).await {
                return SessionEnd::Dropped(e);
            }
        }
        if resubscribing {
            self.broadcast(StreamEvent::Resubscribed);
        }
        info!("[conn {}] connected, {} subscriptions", self.url, self.subs.len());

        let mut ping = self.config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Subscribe(sub)) => {
                        debug!("[conn {}] subscribing {}", self.url, sub.id);
                        let sent = sink.send_text(sub.subscribe_message.clone()).await;
                        add_sub(&mut self.subs, sub);
                        if let Err(e) = sent {
                            return SessionEnd::Dropped(e);
                        }
                    }
                    Some(ConnCommand::Unsubscribe(id)) => {
                        if let Some(sub) = remove_sub(&mut self.subs, &id) {
                            debug!("[conn {}] unsubscribing {id}", self.url);
                            if let Some(msg) = &sub.unsubscribe_message {
                                if let Err(e) = sink.send_text(msg.clone()).await {
                                    return SessionEnd::Dropped(e);
                                }
                            }
                        }
                    }
                    Some(ConnCommand::Refresh) => {}
                    Some(ConnCommand::Close) | None => {
                        self.set_state(ConnectionState::Disconnecting);
                        info!("[conn {}] closing", self.url);
                        if let Err(e) = sink.close().await {
                            debug!("[conn {}] close: {e}", self.url);
                        }
                        return SessionEnd::Closed;
                    }
                },

                frame = source.next_frame() => match frame {
                    Some(Ok(WireFrame::Text(text))) => self.route(&text),
                    Some(Ok(WireFrame::Ping(payload))) => {
                        if let Err(e) = sink.send_pong(payload).await {
                            return SessionEnd::Dropped(e);
                        }
                    }
                    Some(Ok(WireFrame::Close { clean: true })) => return SessionEnd::CleanClose,
                    Some(Ok(WireFrame::Close { clean: false })) => {
                        let err = FeedError::WebSocket("closed without handshake".into());
                        return SessionEnd::Dropped(err);
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e),
                    None => return SessionEnd::Dropped(FeedError::WebSocket("stream ended".into())),
                },

                _ = next_tick(&mut ping) => {
                    if let Err(e) = sink.send_ping().await {
                        return SessionEnd::Dropped(e);
                    }
                }
            }
        }
    }

    /// Parse once, then filter and dispatch to every subscription.
    fn route(&self, text: &str) {
        let received_at_ms = time_util::now_ms();
        let frame: Arc<Value> = match serde_json::from_str(text) {
            Ok(v) => Arc::new(v),
            Err(e) => {
                warn!("[conn {}] unparseable frame: {e}", self.url);
                self.broadcast(StreamEvent::Error(FeedError::Parse(e.to_string())));
                return;
            }
        };

        let value: &Value = &frame;
        for sub in &self.subs {
            if !(sub.message_filter)(value) {
                continue;
            }
            if sub.error_filter.as_ref().is_some_and(|f| f(value)) {
                sub.emit(StreamEvent::Error(FeedError::Upstream(value.to_string())));
            } else {
                sub.emit(StreamEvent::Message {
                    frame: Arc::clone(&frame),
                    received_at_ms,
                });
            }
        }
    }

    /// Sleep out a backoff delay. A new subscription or a refresh cuts it
    /// short; a close cancels it.
    async fn sleep_backoff(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Reconnect,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Subscribe(sub)) => {
                        add_sub(&mut self.subs, sub);
                        return Wait::Reconnect;
                    }
                    Some(ConnCommand::Refresh) => return Wait::Reconnect,
                    Some(cmd) => {
                        if !apply_offline(&self.url, &mut self.subs, cmd) {
                            return Wait::Exit;
                        }
                    }
                    None => return Wait::Exit,
                },
            }
        }
    }

    /// Idle after a clean close until someone needs the connection again.
    async fn wait_for_demand(&mut self) -> Wait {
        loop {
            match self.cmd_rx.recv().await {
                Some(ConnCommand::Subscribe(sub)) => {
                    add_sub(&mut self.subs, sub);
                    return Wait::Reconnect;
                }
                Some(ConnCommand::Refresh) => return Wait::Reconnect,
                Some(cmd) => {
                    if !apply_offline(&self.url, &mut self.subs, cmd) {
                        return Wait::Exit;
                    }
                }
                None => return Wait::Exit,
            }
        }
    }

    fn finish_closed(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        self.broadcast(StreamEvent::Closed);
        info!("[conn {}] closed", self.url);
    }

    /// Out of reconnect budget: tell every subscription, including ones
    /// whose subscribe raced with the failure, then stop.
    fn finish_fatal(&mut self, fatal: FeedError) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            let _ = apply_offline(&self.url, &mut self.subs, cmd);
        }
        self.set_state(ConnectionState::Disconnected);
        self.broadcast(StreamEvent::Error(fatal));
        self.broadcast(StreamEvent::Closed);
    }

    fn broadcast(&self, event: StreamEvent) {
        for sub in &self.subs {
            sub.emit(event.clone());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// Apply a command while no socket is open. Nothing goes on the wire: a new
/// socket sends every registered subscribe message anyway.
///
/// Returns `false` for [`ConnCommand::Close`].
fn apply_offline(url: &str, subs: &mut Vec<Arc<ActiveSubscription>>, cmd: ConnCommand) -> bool {
    match cmd {
        ConnCommand::Subscribe(sub) => {
            debug!("[conn {url}] queued {}", sub.id);
            add_sub(subs, sub);
        }
        ConnCommand::Unsubscribe(id) => {
            remove_sub(subs, &id);
        }
        ConnCommand::Refresh => {}
        ConnCommand::Close => return false,
    }
    true
}

fn add_sub(subs: &mut Vec<Arc<ActiveSubscription>>, sub: Arc<ActiveSubscription>) {
    match subs.iter_mut().find(|s| s.id == sub.id) {
        Some(slot) => *slot = sub,
        None => subs.push(sub),
    }
}

fn remove_sub(
    subs: &mut Vec<Arc<ActiveSubscription>>,
    id: &str,
) -> Option<Arc<ActiveSubscription>> {
    let pos = subs.iter().position(|s| s.id == id)?;
    Some(subs.remove(pos))
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

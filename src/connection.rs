//! Connection lifecycle.
//!
//! A [`Connection`] owns one [`Session`] and drives it through
//! `Disconnected → Connecting → Connected → Stopping → Disconnected`,
//! asking a [`Connector`] for a fresh transport on every attempt and
//! a [`ReconnectPolicy`] for the delay between attempts.  The current
//! state is published on a `watch` channel so callers can await a
//! transition instead of polling.
//!
//! Tearing a session down always happens in the same order: the
//! keepalive timer is cancelled, both session tasks are stopped and
//! awaited (which releases the transport), and only then is
//! [`Session::on_disconnect`] run, synchronously, so every close
//! callback has fired before the state returns to `Disconnected`.

use std::sync::{Arc, Mutex};

use futures_util::future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::network::{BoxTransport, Connector, ReconnectPolicy};
use crate::protocol::Message;
use crate::scheduler::{FiringPolicy, Scheduler};
use crate::session::{DisconnectReason, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
}

/// Handle to a running connection.  Cloning is cheap.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    session: Arc<Session>,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn ReconnectPolicy>,
    scheduler: Scheduler,
    state: watch::Sender<ConnectionState>,
    stop: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        session: Arc<Session>,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn ReconnectPolicy>,
        scheduler: Scheduler,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                session,
                connector,
                policy,
                scheduler,
                state,
                stop,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Begin connecting in the background.  Returns `false` if the
    /// connection is already running.
    pub fn start(&self) -> bool {
        let mut driver = self.inner.driver.lock().unwrap_or_else(|err| err.into_inner());
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        self.inner.stop.send_replace(false);
        let stop = self.inner.stop.subscribe();
        *driver = Some(tokio::spawn(drive(self.inner.clone(), stop)));
        true
    }

    /// Stop the connection and wait until it is fully torn down.  No
    /// reconnect is attempted afterwards.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let handle = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "connection driver ended abnormally");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `state`.  Returns
    /// immediately if it is already there.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|current| *current == state).await;
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state");
        }
    }

    /// Run one established session until it drops or a stop is
    /// requested, then tear it down.
    async fn run_session(
        &self,
        transport: BoxTransport,
        stop: &mut watch::Receiver<bool>,
    ) -> DisconnectReason {
        let mut tasks = self.session.start(transport);
        self.set_state(ConnectionState::Connected);
        info!("connected");

        let keepalive = self.session.config().keepalive().map(|interval| {
            let outbound = tasks.outbound.clone();
            self.scheduler
                .run_periodic(interval, interval, FiringPolicy::Skip, move || {
                    if outbound.send(Message::Ping).is_err() {
                        debug!("keepalive skipped; writer gone");
                    }
                })
        });

        let reason = tokio::select! {
            reason = tasks.disconnected.recv() => reason.unwrap_or(DisconnectReason::PeerClosed),
            _ = stop.wait_for(|stopped| *stopped) => DisconnectReason::Stopped,
        };

        self.set_state(ConnectionState::Stopping);
        if let Some(handle) = keepalive {
            handle.cancel();
        }
        tasks.reader.abort();
        tasks.writer.abort();
        let _ = future::join(tasks.reader, tasks.writer).await;
        self.session.on_disconnect();
        reason
    }
}

async fn drive(inner: Arc<ConnectionInner>, mut stop: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if *stop.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            result = inner.connector.connect() => result,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        match connected {
            Ok(transport) => {
                attempt = 0;
                let reason = inner.run_session(transport, &mut stop).await;
                if reason == DisconnectReason::Stopped {
                    info!("disconnected: {reason}");
                    break;
                }
                warn!("disconnected: {reason}");
            }
            Err(err) => warn!(error = %err, attempt = attempt + 1, "connect failed"),
        }
        inner.set_state(ConnectionState::Disconnected);

        attempt = attempt.saturating_add(1);
        let Some(delay) = inner.policy.next_delay(attempt) else {
            info!(attempt, "reconnect policy gave up");
            break;
        };
        debug!(?delay, attempt, "reconnecting");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
    inner.set_state(ConnectionState::Disconnected);
}

//! Shared fixtures for the link integration tests.
//!
//! [`Loopback`] connects a requester-only client to a responder-only
//! server over an in-memory duplex pipe, one fresh pipe per connection
//! attempt, so the full session stack runs without sockets.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use link_engine::config::{LinkConfig, ProtocolVersion, SchedulerSection};
use link_engine::network::{BoxTransport, Connector, ReconnectPolicy};
use link_engine::protocol::{Response, SubscriptionId, ValueUpdate};
use link_engine::{
    Connection, ConnectionState, LinkError, MemoryTree, Requester, Responder, ResponseHandler,
    Scheduler, Session, SubscriptionHandler,
};
use tokio::io::duplex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("link_engine=debug")
            .try_init();
    });
}

pub fn v1() -> LinkConfig {
    LinkConfig {
        protocol: ProtocolVersion::V1,
        keepalive_secs: 0,
        ..LinkConfig::default()
    }
}

/// v2 with frames small enough that most messages are multipart and a
/// window tight enough that the writer has to wait for acks.
pub fn v2_small() -> LinkConfig {
    LinkConfig {
        protocol: ProtocolVersion::V2,
        max_frame_size: 64,
        ack_window: 2,
        keepalive_secs: 0,
        ..LinkConfig::default()
    }
}

pub fn scheduler() -> Scheduler {
    Scheduler::new(&SchedulerSection { max_workers: 4 })
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Records everything a request stream reports.
#[derive(Default)]
pub struct Recorder {
    pub responses: Mutex<Vec<Response>>,
    pub errors: Mutex<Vec<LinkError>>,
    pub closes: Mutex<usize>,
}

impl Recorder {
    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }

    pub fn errors(&self) -> Vec<LinkError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().unwrap().clone()
    }
}

impl ResponseHandler for Recorder {
    fn handle_response(&self, response: &Response) {
        self.responses.lock().unwrap().push(response.clone());
    }

    fn handle_error(&self, error: &LinkError) {
        self.errors.lock().unwrap().push(error.clone());
    }

    fn handle_close(&self) {
        *self.closes.lock().unwrap() += 1;
    }
}

/// Records the values and closes of one subscription.
#[derive(Default)]
pub struct Watcher {
    pub updates: Mutex<Vec<ValueUpdate>>,
    pub closes: Mutex<usize>,
}

impl Watcher {
    pub fn values(&self) -> Vec<serde_json::Value> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.value.clone())
            .collect()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

impl SubscriptionHandler for Watcher {
    fn handle_update(&self, _sid: SubscriptionId, update: &ValueUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }

    fn handle_close(&self, _sid: SubscriptionId) {
        *self.closes.lock().unwrap() += 1;
    }
}

struct ServerLink {
    cut: Arc<Notify>,
    monitor: JoinHandle<()>,
}

/// A [`Connector`] whose far end is a responder session over a duplex
/// pipe.
pub struct Loopback {
    server: Arc<Session>,
    links: Mutex<Vec<ServerLink>>,
    attempts: Mutex<usize>,
}

impl Loopback {
    pub fn new(server: Arc<Session>) -> Self {
        Self {
            server,
            links: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Tear down the server side of the newest link, as if the peer
    /// dropped the connection, and wait until it has cleaned up.
    pub async fn cut(&self) {
        let link = self.links.lock().unwrap().pop();
        if let Some(link) = link {
            link.cut.notify_one();
            link.monitor.await.unwrap();
        }
    }

    /// Wait until every server link has wound down by itself.
    pub async fn drain(&self) {
        let links: Vec<_> = self.links.lock().unwrap().drain(..).collect();
        for link in links {
            timeout(Duration::from_secs(2), link.monitor)
                .await
                .expect("server side never noticed the disconnect")
                .unwrap();
        }
    }
}

#[async_trait]
impl Connector for Loopback {
    async fn connect(&self) -> io::Result<BoxTransport> {
        *self.attempts.lock().unwrap() += 1;
        let (client, server) = duplex(64 * 1024);
        let mut tasks = self.server.start(server);
        let session = self.server.clone();
        let cut = Arc::new(Notify::new());
        let cut_signal = cut.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                _ = tasks.disconnected.recv() => {}
                _ = cut_signal.notified() => {}
            }
            tasks.reader.abort();
            tasks.writer.abort();
            let _ = future::join(tasks.reader, tasks.writer).await;
            session.on_disconnect();
        });
        self.links.lock().unwrap().push(ServerLink { cut, monitor });
        Ok(Box::new(client))
    }
}

/// A requester client wired to a responder server serving `tree`.
pub struct Pair {
    pub tree: Arc<MemoryTree>,
    pub requester: Requester,
    pub responder: Responder,
    pub loopback: Arc<Loopback>,
    pub connection: Connection,
}

impl Pair {
    pub fn new(config: LinkConfig, policy: Arc<dyn ReconnectPolicy>) -> Self {
        Self::with_configs(config.clone(), config, policy)
    }

    pub fn with_configs(
        client_config: LinkConfig,
        server_config: LinkConfig,
        policy: Arc<dyn ReconnectPolicy>,
    ) -> Self {
        init_tracing();
        let tree = Arc::new(MemoryTree::new());
        let responder = Responder::new(scheduler(), tree.clone());
        let server = Arc::new(Session::new(server_config, None, Some(responder.clone())));
        let loopback = Arc::new(Loopback::new(server));

        let client_scheduler = scheduler();
        let requester = Requester::new(client_scheduler.clone());
        let client = Arc::new(Session::new(client_config, Some(requester.clone()), None));
        let connection = Connection::new(client, loopback.clone(), policy, client_scheduler);
        Self {
            tree,
            requester,
            responder,
            loopback,
            connection,
        }
    }

    pub async fn connect(&self) {
        self.connection.start();
        timeout(
            Duration::from_secs(2),
            self.connection.wait_for(ConnectionState::Connected),
        )
        .await
        .expect("never connected");
    }
}

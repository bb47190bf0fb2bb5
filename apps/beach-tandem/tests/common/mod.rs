//! Simulated cluster: nodes sharing one in-process store and bus.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use beach_tandem::access::{AccessControl, Principal, StaticAccess};
use beach_tandem::config::Config;
use beach_tandem::error::CollabError;
use beach_tandem::node::Node;
use beach_tandem::protocol::{ClientAction, ServerEvent};
use beach_tandem::registry::LocalConnection;
use beach_tandem::store::{MemoryStore, RoomStateStore};
use beach_tandem::telemetry::detached_metrics_handle;
use transport_bus::LocalBus;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<LocalBus>,
    pub nodes: Vec<Arc<Node>>,
}

impl Cluster {
    pub async fn start(nodes: usize) -> Self {
        Self::with_access(nodes, Config::default(), Arc::new(StaticAccess::allow_all())).await
    }

    pub async fn with_access(nodes: usize, config: Config, access: Arc<dyn AccessControl>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let mut started = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            let node = Node::start(
                config.clone(),
                store.clone(),
                bus.clone(),
                Arc::clone(&access),
                detached_metrics_handle(),
            )
            .await
            .expect("node starts");
            started.push(Arc::new(node));
        }
        Self {
            store,
            bus,
            nodes: started,
        }
    }

    /// Dirty map as kept in the shared store.
    pub async fn store_snapshot(&self, room: &str) -> Map<String, Value> {
        self.store
            .snapshot(room)
            .await
            .expect("store reachable")
            .expect("room exists")
            .changes
    }

    /// Make `node` look dead until its next heartbeat.
    pub async fn expire_node(&self, node: &str) {
        // let the node's first heartbeat land before overwriting it
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.store
            .heartbeat(node, Duration::ZERO)
            .await
            .expect("store reachable");
    }

    /// Wait until `node` has applied the feature flag value.
    pub async fn wait_for_flag(&self, node: usize, enabled: bool) {
        let bridge = self.nodes[node].bridge();
        timeout(WAIT, async {
            while bridge.is_enabled() != enabled {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("flag did not propagate");
    }

    pub fn connect(&self, node: usize, user: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = self.nodes[node].coordinator();
        let connection = coordinator.connect(Principal::new(user), tx);
        Client {
            node: Arc::clone(&self.nodes[node]),
            connection,
            rx,
        }
    }
}

pub struct Client {
    pub node: Arc<Node>,
    pub connection: Arc<LocalConnection>,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Client {
    pub fn id(&self) -> &str {
        &self.connection.id
    }

    pub async fn send(&self, action: ClientAction) -> Result<(), CollabError> {
        self.node.coordinator().handle(&self.connection, action).await
    }

    /// Send a raw envelope the way the socket loop does.
    pub async fn send_json(&self, frame: Value) -> Result<(), CollabError> {
        let action = ClientAction::parse(&frame.to_string())?;
        self.send(action).await
    }

    /// Join and return the room id from `init`.
    pub async fn join(&mut self, collection: &str, item: &str) -> String {
        self.send(ClientAction::Join {
            collection: collection.into(),
            item: Some(item.into()),
            version: None,
            color: None,
            initial_changes: None,
        })
        .await
        .expect("join succeeds");
        match self.next().await {
            ServerEvent::Init { room, .. } => room,
            other => panic!("expected init, got {other:?}"),
        }
    }

    pub async fn next(&mut self) -> ServerEvent {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection channel closed")
    }

    /// Skip events until one matches.
    pub async fn next_matching(&mut self, wanted: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.next().await;
            if wanted(&event) {
                return event;
            }
        }
    }

    /// Nothing arrives within a short grace period.
    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(event)) = timeout(Duration::from_millis(150), self.rx.recv()).await {
            panic!("unexpected event {event:?}");
        }
    }
}

pub fn changes(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(field, value)| (field.to_string(), value.clone()))
        .collect()
}

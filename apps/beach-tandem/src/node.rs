//! One coordinator process: its components, background tasks and HTTP router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use transport_bus::{Bus, BusMessage};

use crate::access::AccessControl;
use crate::arbiter::LeaderArbitrator;
use crate::bridge::ExternalEventBridge;
use crate::bus::{ControlMessage, CONTROL_TOPIC};
use crate::config::Config;
use crate::coordinator::RoomCoordinator;
use crate::fanout::RoomFeeds;
use crate::handlers::{
    get_collab_settings, health_check, item_deleted, item_saved, put_collab_settings,
    render_metrics, room_snapshot,
};
use crate::registry::ConnectionRegistry;
use crate::store::RoomStateStore;
use crate::websocket::websocket_handler;

const MIN_TICK: Duration = Duration::from_millis(100);

pub struct Node {
    id: String,
    config: Config,
    coordinator: Arc<RoomCoordinator>,
    bridge: Arc<ExternalEventBridge>,
    metrics: PrometheusHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Wire the components around a shared store and bus and start the heartbeat, sweep
    /// and control-topic tasks.
    pub async fn start(
        config: Config,
        store: Arc<dyn RoomStateStore>,
        bus: Arc<dyn Bus>,
        access: Arc<dyn AccessControl>,
        metrics: PrometheusHandle,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();

        let initial = match store.collab_enabled().await {
            Ok(flag) => flag.unwrap_or(true),
            Err(err) => {
                warn!(error = %err, "couldn't read collaborative editing flag, assuming enabled");
                true
            }
        };
        let (enabled_tx, enabled_rx) = watch::channel(initial);

        let registry = Arc::new(ConnectionRegistry::new());
        let feeds = RoomFeeds::new(Arc::clone(&bus), Arc::clone(&registry), config.reorder_window());
        let coordinator = Arc::new(RoomCoordinator::new(
            id.clone(),
            &config,
            Arc::clone(&store),
            Arc::clone(&bus),
            registry,
            feeds,
            access,
            enabled_rx,
        ));
        let arbiter = LeaderArbitrator::new(Arc::clone(&store), id.clone(), config.claim_ttl());
        let bridge = Arc::new(ExternalEventBridge::new(
            Arc::clone(&coordinator),
            arbiter,
            Arc::clone(&bus),
            enabled_tx,
        ));

        let control = bus
            .subscribe(CONTROL_TOPIC)
            .await
            .context("failed to subscribe to the control topic")?;

        let sweeper = LeaderArbitrator::new(Arc::clone(&store), id.clone(), config.sweep_interval());
        let tasks = vec![
            tokio::spawn(watch_control(control, Arc::clone(&bridge))),
            tokio::spawn(heartbeat(
                Arc::clone(&store),
                id.clone(),
                config.node_heartbeat(),
                config.node_ttl(),
            )),
            tokio::spawn(sweep(Arc::clone(&coordinator), sweeper, config.sweep_interval())),
        ];

        info!(node = %id, collab_enabled = initial, "node started");
        Ok(Self {
            id,
            config,
            coordinator,
            bridge,
            metrics,
            tasks,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    pub fn bridge(&self) -> &Arc<ExternalEventBridge> {
        &self.bridge
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let routes = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(render_metrics))
            .route("/ws", get(websocket_handler))
            .route("/hooks/items/saved", post(item_saved))
            .route("/hooks/items/deleted", post(item_deleted))
            .route(
                "/settings/collab",
                get(get_collab_settings).put(put_collab_settings),
            )
            .route("/rooms/:room", get(room_snapshot))
            .with_state(Arc::clone(self));

        Router::new()
            .merge(routes)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn watch_control(
    mut receiver: broadcast::Receiver<BusMessage>,
    bridge: Arc<ExternalEventBridge>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => match ControlMessage::decode(&message.payload) {
                Ok(ControlMessage::CollabEnabled { enabled }) => bridge.apply_flag(enabled).await,
                Err(err) => warn!(error = %err, "dropping undecodable control message"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "control topic lagged, re-reading flag");
                bridge.refresh_flag().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    warn!("control topic closed");
}

async fn heartbeat(store: Arc<dyn RoomStateStore>, node: String, every: Duration, ttl: Duration) {
    let every = every.max(MIN_TICK);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = store.heartbeat(&node, ttl).await {
            error!(node = %node, error = %err, "heartbeat failed");
        }
    }
}

/// One node per interval removes participants left behind by dead nodes.
async fn sweep(coordinator: Arc<RoomCoordinator>, arbiter: LeaderArbitrator, every: Duration) {
    let every = every.max(MIN_TICK);
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let slot = chrono::Utc::now().timestamp_millis() / every.as_millis().max(1) as i64;
        let fingerprint = LeaderArbitrator::fingerprint(&["sweep", &slot.to_string()]);
        if !arbiter.claim("sweep", &fingerprint).await {
            continue;
        }
        match coordinator.sweep_dead_participants().await {
            Ok(0) => debug!("sweep found no dead participants"),
            Ok(removed) => info!(removed, "sweep removed dead participants"),
            Err(err) => error!(error = %err, "sweep failed"),
        }
    }
}

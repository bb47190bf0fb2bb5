use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::metrics;
use crate::store::RoomStateStore;

/// Decides which of several nodes that observed the same event gets to publish it.
///
/// There is no long-lived leader: each event is claimed on its own with a short TTL,
/// keyed by a fingerprint every observer computes identically.
#[derive(Clone)]
pub struct LeaderArbitrator {
    store: Arc<dyn RoomStateStore>,
    node: String,
    ttl: Duration,
}

impl LeaderArbitrator {
    pub fn new(store: Arc<dyn RoomStateStore>, node: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            node: node.into(),
            ttl,
        }
    }

    /// Hex digest over event data that every node sees the same way.
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// `true` when this node should publish. An unreachable claim store fails open.
    pub async fn claim(&self, scope: &str, fingerprint: &str) -> bool {
        let key = format!("{}:{}", scope, fingerprint);
        match self.store.claim(&key, &self.node, self.ttl).await {
            Ok(true) => {
                metrics::claim("won");
                debug!(scope, node = %self.node, "claim won");
                true
            }
            Ok(false) => {
                metrics::claim("lost");
                debug!(scope, node = %self.node, "claim lost");
                false
            }
            Err(err) => {
                metrics::claim("fail_open");
                warn!(scope, error = %err, "claim store unavailable, publishing anyway");
                true
            }
        }
    }
}

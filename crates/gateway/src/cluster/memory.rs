//! In-process fan-out bus shared by every gateway in the same process.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use proto::{ClusterPacket, ConfigError, GatewayError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{AdapterTarget, ClusterAdapter};

const BUS_CAPACITY: usize = 1024;
const SUBSCRIBER_BUFFER: usize = 256;

fn buses() -> &'static DashMap<String, broadcast::Sender<ClusterPacket>> {
    static BUSES: OnceLock<DashMap<String, broadcast::Sender<ClusterPacket>>> = OnceLock::new();
    BUSES.get_or_init(DashMap::new)
}

/// Adapter backed by a process-wide `tokio::sync::broadcast` bus keyed by channel name.
pub struct MemoryAdapter {
    channel: String,
    tx: broadcast::Sender<ClusterPacket>,
}

impl MemoryAdapter {
    /// Joins (or creates) the bus named `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let tx = buses()
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone();
        Self { channel, tx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Registry constructor: the URL, or `host:port/db`, names the bus.
pub(super) fn construct(target: &AdapterTarget) -> Result<Arc<dyn ClusterAdapter>, ConfigError> {
    let channel = match target {
        AdapterTarget::Url(url) => url.clone(),
        AdapterTarget::Options(opts) => format!("{}:{}/{}", opts.host, opts.port, opts.db),
    };
    Ok(Arc::new(MemoryAdapter::new(channel)))
}

#[async_trait]
impl ClusterAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, packet: &ClusterPacket) -> Result<(), GatewayError> {
        // No subscribers is not an error for a bus.
        let _ = self.tx.send(packet.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterPacket>, GatewayError> {
        let mut bus_rx = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(packet) => {
                        if tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %channel, "Memory bus subscription ended");
        });
        Ok(rx)
    }
}

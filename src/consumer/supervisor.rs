//! Keeps one consumer continuously subscribed to a transport, self-healing
//! after disconnects.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::broker::Delivery;
use crate::error::{Error, Result};

use super::transport::{Channel, ChannelEvent, Topology, Transport};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
    Terminated,
}

/// Receives each inbound delivery. Acknowledgement of the delivery is the
/// handler's responsibility, not the supervisor's.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, channel: &Arc<dyn Channel>, delivery: Delivery) -> Result<()>;
}

/// Owns the lifecycle of one subscription: connect, declare topology, apply
/// the credit limit, receive, and reconnect forever on failure with a fixed
/// delay.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    topology: Topology,
    handler: Arc<dyn DeliveryHandler>,
    prefetch: u16,
    reconnect_delay: Duration,
    terminated: AtomicBool,
    reconnecting: AtomicBool,
    state: Mutex<SupervisorState>,
    live: tokio::sync::Mutex<Option<Arc<dyn Channel>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        topology: Topology,
        handler: Arc<dyn DeliveryHandler>,
        prefetch: u16,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            topology,
            handler,
            prefetch,
            reconnect_delay,
            terminated: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            state: Mutex::new(SupervisorState::Disconnected),
            live: tokio::sync::Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    /// Whether `terminate` was called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Establish the subscription, retrying forever with a fixed delay
    /// until success or termination.
    pub async fn start_consuming(self: Arc<Self>) {
        loop {
            if self.is_terminated() {
                self.set_state(SupervisorState::Terminated);
                return;
            }

            self.set_state(SupervisorState::Connecting);
            match self.clone().subscribe().await {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    if self.is_terminated() {
                        self.set_state(SupervisorState::Terminated);
                        return;
                    }
                    tracing::error!("Failed to connect because {}", e);
                    tracing::info!("Sleeping before reconnecting");
                    sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn subscribe(self: Arc<Self>) -> Result<()> {
        let channel = self.transport.connect().await?;

        channel.declare_topology(&self.topology).await?;
        channel.set_prefetch(self.prefetch).await?;
        let events = channel.consume(&self.topology.queue).await?;

        // Termination may have raced the connect. The live lock is the
        // arbiter: a channel stored after terminate() drained the slot
        // would never be closed.
        {
            let mut live = self.live.lock().await;
            if self.is_terminated() {
                drop(live);
                let _ = channel.close().await;
                return Err(Error::Terminated);
            }
            *live = Some(channel.clone());
            self.set_state(SupervisorState::Subscribed);
        }
        tracing::debug!("Channel opened for {}", self.topology.queue);

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.receive(channel, events).await });
        Ok(())
    }

    async fn receive(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        mut events: mpsc::Receiver<ChannelEvent>,
    ) {
        let reason = loop {
            match events.recv().await {
                Some(ChannelEvent::Delivery(delivery)) => {
                    if let Err(e) = self.handler.on_delivery(&channel, delivery).await {
                        tracing::warn!(
                            "Handler failed for routing key {}: {}",
                            self.topology.routing_key,
                            e
                        );
                    }
                }
                Some(ChannelEvent::Shutdown(reason)) => break reason,
                None => break "channel event stream ended".to_string(),
            }
        };

        self.handle_shutdown(&reason);
    }

    /// React to a transport shutdown notification: schedule exactly one
    /// reconnect after the fixed delay, unless terminated.
    pub fn handle_shutdown(self: Arc<Self>, reason: &str) {
        if self.is_terminated() {
            self.set_state(SupervisorState::Terminated);
            return;
        }

        // Overlapping notifications must not race two reconnect attempts.
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Reconnect already in progress");
            return;
        }

        self.set_state(SupervisorState::Reconnecting);
        tracing::warn!("Channel closed because {}", reason);

        tokio::spawn(async move {
            sleep(self.reconnect_delay).await;
            tracing::debug!("Reopening channel...");
            self.start_consuming().await;
        });
    }

    /// Stop for good. The terminated flag is set before the live channel is
    /// closed, so a shutdown notification racing termination cannot trigger
    /// a spurious reconnect.
    pub async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);

        // State and channel writes are ordered by the live lock, so a
        // subscribe that already stored its channel cannot leave the state
        // at Subscribed afterwards.
        let channel = {
            let mut live = self.live.lock().await;
            self.set_state(SupervisorState::Terminated);
            live.take()
        };
        if let Some(channel) = channel {
            tracing::debug!("Closing channel...");
            if let Err(e) = channel.close().await {
                tracing::warn!("Channel close failed: {}", e);
            }
            tracing::debug!("Channel closed");
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap() = state;
    }
}

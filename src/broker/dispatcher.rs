//! Poll-driven dispatch loop moving envelopes from mailboxes to clients.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::bindings::BindingTable;
use super::clients::{ClientRegistry, Delivery};
use super::exchange::ExchangeTable;

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Running,
    Draining,
}

struct Run {
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Owns the single background worker that polls mailboxes and hands one
/// envelope at a time to registered clients.
pub struct Dispatcher {
    exchange: ExchangeTable,
    bindings: BindingTable,
    clients: ClientRegistry,
    poll_interval: Duration,
    drain_timeout: Duration,
    state: Arc<Mutex<DispatcherState>>,
    run: tokio::sync::Mutex<Option<Run>>,
}

impl Dispatcher {
    /// Create a dispatcher over the given tables.
    pub fn new(
        exchange: ExchangeTable,
        bindings: BindingTable,
        clients: ClientRegistry,
        poll_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            bindings,
            clients,
            poll_interval,
            drain_timeout,
            state: Arc::new(Mutex::new(DispatcherState::Stopped)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap()
    }

    /// Start the background worker, stopping any previous run first.
    pub async fn start(&self) {
        self.stop().await;

        tracing::debug!("Starting message monitoring");

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_loop(
            self.exchange.clone(),
            self.bindings.clone(),
            self.clients.clone(),
            self.poll_interval,
            cancel.clone(),
        ));

        let mut run = self.run.lock().await;
        *run = Some(Run { cancel, worker });
        *self.state.lock().unwrap() = DispatcherState::Running;
    }

    /// Stop the worker after a bounded drain wait.
    ///
    /// Safe to call when never started, and idempotent on repeat calls.
    pub async fn stop(&self) {
        let Some(run) = self.run.lock().await.take() else {
            return;
        };

        *self.state.lock().unwrap() = DispatcherState::Draining;
        tracing::info!("Draining exchange...");

        let deadline = Instant::now() + self.drain_timeout;
        while !self.exchange.is_empty() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Drain budget exhausted with {} messages still queued",
                    self.exchange.total_pending()
                );
                break;
            }
            tracing::debug!("Waiting for queues to drain...");
            sleep(self.poll_interval).await;
        }

        tracing::debug!("Stopping message monitoring");
        run.cancel.store(true, Ordering::SeqCst);
        if let Err(e) = run.worker.await {
            tracing::error!("Dispatcher worker ended abnormally: {}", e);
        }

        *self.state.lock().unwrap() = DispatcherState::Stopped;
    }
}

async fn run_loop(
    exchange: ExchangeTable,
    bindings: BindingTable,
    clients: ClientRegistry,
    poll_interval: Duration,
    cancel: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        dispatch_pass(&exchange, &bindings, &clients);
    }
}

/// One full scan over the mailboxes: at most one envelope is dequeued per
/// routing key per pass. Returns the number of deliveries attempted.
fn dispatch_pass(
    exchange: &ExchangeTable,
    bindings: &BindingTable,
    clients: &ClientRegistry,
) -> usize {
    let mut dispatched = 0;

    for routing_key in exchange.routing_keys_with_pending() {
        // No binding for the routing key; the message stays queued.
        let Some(queue_name) = bindings.get(&routing_key) else {
            continue;
        };

        // No live client for the queue; the message stays queued.
        let Some(client) = clients.lookup(&queue_name) else {
            continue;
        };

        // Consumer is at its credit limit; try again next pass.
        if !client.credit.available() {
            continue;
        }

        let Some(envelope) = exchange.try_dequeue(&routing_key) else {
            continue;
        };

        // Delivered the instant it is dequeued; failures are not re-queued.
        let delivery_tag = client.credit.issue();
        let delivery = Delivery {
            delivery_tag,
            redelivered: false,
            exchange: client.exchange.clone(),
            routing_key: routing_key.clone(),
            properties: envelope.properties,
            body: envelope.body,
        };

        dispatched += 1;

        // A failing or panicking callback must not take down the poll loop.
        match catch_unwind(AssertUnwindSafe(|| client.target.deliver(delivery))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                client.credit.settle(delivery_tag, false);
                tracing::warn!(
                    "Delivery to queue {} for routing key {} failed: {}",
                    queue_name,
                    routing_key,
                    e
                );
            }
            Err(_) => {
                client.credit.settle(delivery_tag, false);
                tracing::error!(
                    "Delivery callback for queue {} panicked; message dropped",
                    queue_name
                );
            }
        }
    }

    dispatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::clients::ClientHandle;
    use crate::broker::DeliveryTarget;
    use crate::error::{Error, Result};
    use crate::protocol::{MessageEnvelope, MessageProperties};

    const TICK: Duration = Duration::from_millis(10);

    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn bodies(&self) -> Vec<Vec<u8>> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DeliveryTarget for Recorder {
        fn deliver(&self, delivery: Delivery) -> Result<()> {
            self.seen.lock().unwrap().push(delivery.body);
            Ok(())
        }
    }

    struct FailingTarget;

    impl DeliveryTarget for FailingTarget {
        fn deliver(&self, _delivery: Delivery) -> Result<()> {
            Err(Error::Delivery("handler rejected message".to_string()))
        }
    }

    fn dispatcher(
        exchange: &ExchangeTable,
        bindings: &BindingTable,
        clients: &ClientRegistry,
    ) -> Dispatcher {
        Dispatcher::new(
            exchange.clone(),
            bindings.clone(),
            clients.clone(),
            TICK,
            Duration::from_secs(2),
        )
    }

    fn envelope(key: &str, body: &[u8]) -> MessageEnvelope {
        MessageEnvelope::new(key, MessageProperties::default(), body.to_vec())
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(TICK).await;
        }
        panic!("condition not reached within budget");
    }

    #[tokio::test]
    async fn test_publish_bind_register_delivers_once() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        // Publish before any binding or registration exists.
        exchange.publish(envelope("k", b"hello"));
        dispatcher.start().await;

        bindings.bind("q", "k");
        let recorder = Recorder::new();
        clients.register(ClientHandle::new("q", "fleet", recorder.clone(), 0));

        wait_for(|| !recorder.bodies().is_empty()).await;
        assert_eq!(recorder.bodies(), vec![b"hello".to_vec()]);
        assert!(exchange.is_empty());

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_fifo_order_within_key() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        bindings.bind("q", "k");
        let recorder = Recorder::new();
        clients.register(ClientHandle::new("q", "fleet", recorder.clone(), 0));

        for i in 0u8..5 {
            exchange.publish(envelope("k", &[i]));
        }
        dispatcher.start().await;

        wait_for(|| recorder.bodies().len() == 5).await;
        let expected: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i]).collect();
        assert_eq!(recorder.bodies(), expected);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_unbound_message_stays_queued() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        exchange.publish(envelope("unbound", b"x"));
        dispatcher.start().await;

        // Many poll cycles with no binding: nothing is dropped.
        sleep(TICK * 10).await;
        assert!(!exchange.is_empty());
        assert_eq!(exchange.pending("unbound"), 1);

        // Binding alone is not enough without a client either.
        bindings.bind("q", "unbound");
        sleep(TICK * 10).await;
        assert_eq!(exchange.pending("unbound"), 1);

        let recorder = Recorder::new();
        clients.register(ClientHandle::new("q", "fleet", recorder.clone(), 0));
        wait_for(|| exchange.is_empty()).await;
        assert_eq!(recorder.bodies(), vec![b"x".to_vec()]);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_safe_and_idempotent() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        // Stop before start is a no-op.
        dispatcher.stop().await;
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        dispatcher.start().await;
        assert_eq!(dispatcher.state(), DispatcherState::Running);

        dispatcher.stop().await;
        dispatcher.stop().await;
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_drains_pending_messages() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        bindings.bind("q", "k");
        let recorder = Recorder::new();
        clients.register(ClientHandle::new("q", "fleet", recorder.clone(), 0));

        for i in 0u8..10 {
            exchange.publish(envelope("k", &[i]));
        }
        dispatcher.start().await;
        dispatcher.stop().await;

        // Everything published before stop() was dispatched during the drain.
        assert!(exchange.is_empty());
        assert_eq!(recorder.bodies().len(), 10);
    }

    #[tokio::test]
    async fn test_drain_budget_is_bounded() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = Dispatcher::new(
            exchange.clone(),
            bindings.clone(),
            clients.clone(),
            TICK,
            Duration::from_millis(100),
        );

        // Unbound message can never drain.
        exchange.publish(envelope("stuck", b"x"));
        dispatcher.start().await;

        let started = Instant::now();
        dispatcher.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(!exchange.is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_halt_loop() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        bindings.bind("bad", "fails");
        bindings.bind("good", "works");
        clients.register(ClientHandle::new("bad", "fleet", Arc::new(FailingTarget), 0));
        let recorder = Recorder::new();
        clients.register(ClientHandle::new("good", "fleet", recorder.clone(), 0));

        exchange.publish(envelope("fails", b"boom"));
        exchange.publish(envelope("works", b"ok"));
        dispatcher.start().await;

        wait_for(|| !recorder.bodies().is_empty()).await;
        assert_eq!(recorder.bodies(), vec![b"ok".to_vec()]);
        // The failed message was dropped, not re-queued.
        assert_eq!(exchange.pending("fails"), 0);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_credit_limit_defers_delivery() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        bindings.bind("q", "k");
        let recorder = Recorder::new();
        let handle = ClientHandle::new("q", "fleet", recorder.clone(), 1);
        let credit = handle.credit.clone();
        clients.register(handle);

        exchange.publish(envelope("k", b"first"));
        exchange.publish(envelope("k", b"second"));
        dispatcher.start().await;

        // Only one unacknowledged delivery may be in flight.
        wait_for(|| recorder.bodies().len() == 1).await;
        sleep(TICK * 10).await;
        assert_eq!(recorder.bodies().len(), 1);
        assert_eq!(exchange.pending("k"), 1);

        credit.settle(1, false);
        wait_for(|| recorder.bodies().len() == 2).await;
        assert_eq!(recorder.bodies(), vec![b"first".to_vec(), b"second".to_vec()]);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_publish_loses_nothing() {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = dispatcher(&exchange, &bindings, &clients);

        let keys = ["alpha", "beta", "gamma"];
        let recorder = Recorder::new();
        for key in keys {
            let queue = format!("{}-queue", key);
            bindings.bind(&queue, key);
            clients.register(ClientHandle::new(queue, "fleet", recorder.clone(), 0));
        }
        dispatcher.start().await;

        let mut tasks = Vec::new();
        for key in keys {
            let exchange = exchange.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0u8..20 {
                    exchange.publish(envelope(key, &[i]));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        wait_for(|| recorder.bodies().len() == 60).await;
        assert!(exchange.is_empty());

        dispatcher.stop().await;
    }
}

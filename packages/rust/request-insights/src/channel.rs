//! Asynchronous delivery of telemetry envelopes.
//!
//! Every client owns one [`TelemetryChannel`]: a bounded queue feeding a
//! single background sender task. Producers never wait on the queue; when it
//! is full the item is dropped and counted.
//!
//! # Configuration
//!
//! - `APPINSIGHTS_QUEUE_SIZE`: queue capacity, defaults to 2048 items
//! - `APPINSIGHTS_BATCH_SIZE`: max items per transport call, defaults to 512
//! - `APPINSIGHTS_FLUSH_TIMEOUT_MS`: upper bound for [`TelemetryChannel::flush`], defaults to 5000
//!
//! Builder values take precedence over the environment.
//!
//! # Flush semantics
//!
//! A flush enqueues a marker behind everything already queued. The sender
//! hands every item ahead of the marker to the transport, then acknowledges
//! the marker. Items queued concurrently by other producers after the marker
//! are not covered.
//!
//! Handing a batch over means its transport call has started on its own
//! task; the flush does not wait for the backend to answer. At most
//! `max_concurrent_sends` calls run at once. When all of them are busy the
//! sender waits for one to finish, the queue backs up and new items are
//! dropped.

use crate::constants::{defaults, env_vars};
use crate::error::InsightsError;
use crate::logger::Logger;
use crate::transport::{Envelope, Transport};
use bon::bon;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Module-specific logger
static LOGGER: Logger = Logger::const_new("channel");

enum Message {
    Item(Envelope),
    Flush(oneshot::Sender<()>),
}

/// Bounded queue plus background sender for one client.
#[derive(Debug)]
pub struct TelemetryChannel {
    sender: mpsc::Sender<Message>,
    worker: JoinHandle<()>,
    dropped_count: AtomicUsize,
    flush_timeout: Duration,
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

#[bon]
impl TelemetryChannel {
    fn default_max_queue_size() -> usize {
        env_or(env_vars::QUEUE_SIZE, defaults::QUEUE_SIZE)
    }

    fn default_max_batch_size() -> usize {
        env_or(env_vars::BATCH_SIZE, defaults::BATCH_SIZE)
    }

    fn default_flush_timeout() -> Duration {
        env::var(env_vars::FLUSH_TIMEOUT_MS)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults::FLUSH_TIMEOUT)
    }

    /// Create the channel and spawn its sender on the current tokio runtime.
    #[builder]
    pub fn new(
        transport: Arc<dyn Transport>,
        max_queue_size: Option<usize>,
        max_batch_size: Option<usize>,
        flush_timeout: Option<Duration>,
        max_concurrent_sends: Option<usize>,
    ) -> Result<Self, InsightsError> {
        let max_queue_size = max_queue_size
            .unwrap_or_else(Self::default_max_queue_size)
            .max(1);
        let max_batch_size = max_batch_size
            .unwrap_or_else(Self::default_max_batch_size)
            .max(1);
        let flush_timeout = flush_timeout.unwrap_or_else(Self::default_flush_timeout);
        let max_concurrent_sends = max_concurrent_sends
            .unwrap_or(defaults::MAX_CONCURRENT_SENDS)
            .max(1);

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| InsightsError::NoRuntime)?;
        let (sender, receiver) = mpsc::channel(max_queue_size);
        let worker = runtime.spawn(run_sender(
            receiver,
            transport,
            max_batch_size,
            max_concurrent_sends,
        ));

        LOGGER.debug(format!(
            "TelemetryChannel.new: queue_size={}, batch_size={}, flush_timeout={:?}, concurrent_sends={}",
            max_queue_size, max_batch_size, flush_timeout, max_concurrent_sends
        ));

        Ok(Self {
            sender,
            worker,
            dropped_count: AtomicUsize::new(0),
            flush_timeout,
        })
    }
}

impl TelemetryChannel {
    /// Queue an envelope without waiting. Drops it when the queue is full.
    pub fn send(&self, envelope: Envelope) {
        match self.sender.try_send(Message::Item(envelope)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let prev = self.dropped_count.fetch_add(1, Ordering::Relaxed);
                if prev == 0 || prev % 100 == 0 {
                    LOGGER.warn(format!(
                        "TelemetryChannel.send: Dropping item because queue is full (dropped_items={})",
                        prev + 1
                    ));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                LOGGER.warn("TelemetryChannel.send: sender task is gone, dropping item");
            }
        }
    }

    /// Wait until everything queued before this call was handed to the transport.
    pub async fn flush(&self) -> Result<(), InsightsError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        let wait = async {
            self.sender
                .send(Message::Flush(ack_tx))
                .await
                .map_err(|_| InsightsError::ChannelClosed)?;
            ack_rx.await.map_err(|_| InsightsError::ChannelClosed)
        };

        match tokio::time::timeout(self.flush_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(InsightsError::FlushTimeout(self.flush_timeout)),
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    /// Close the queue and wait until every batch, including those already in
    /// flight, has been delivered or failed.
    pub async fn shutdown(self) {
        let Self { sender, worker, .. } = self;
        drop(sender);
        if let Err(e) = worker.await {
            LOGGER.error(format!("TelemetryChannel.shutdown: sender task failed: {}", e));
        }
    }
}

async fn run_sender(
    mut receiver: mpsc::Receiver<Message>,
    transport: Arc<dyn Transport>,
    max_batch_size: usize,
    max_concurrent_sends: usize,
) {
    let mut dispatcher = Dispatcher {
        transport,
        permits: Arc::new(Semaphore::new(max_concurrent_sends)),
        in_flight: JoinSet::new(),
    };
    let mut batch = Vec::with_capacity(max_batch_size);

    while let Some(first) = receiver.recv().await {
        let mut next = Some(first);
        // Drain whatever is already queued before going back to sleep.
        while let Some(message) = next.take() {
            match message {
                Message::Item(envelope) => {
                    batch.push(envelope);
                    if batch.len() >= max_batch_size {
                        dispatcher.dispatch(&mut batch).await;
                    }
                }
                Message::Flush(ack) => {
                    dispatcher.dispatch(&mut batch).await;
                    let _ = ack.send(());
                }
            }
            next = receiver.try_recv().ok();
        }
        dispatcher.dispatch(&mut batch).await;
        dispatcher.reap();
    }

    dispatcher.drain().await;
    LOGGER.debug("TelemetryChannel: queue closed, sender exiting");
}

/// Runs transport calls on their own tasks so the sender never waits on the backend.
struct Dispatcher {
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<()>,
}

impl Dispatcher {
    /// Start delivering `batch` and return once the transport call has begun.
    async fn dispatch(&mut self, batch: &mut Vec<Envelope>) {
        if batch.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };

        let items = std::mem::take(batch);
        let transport = Arc::clone(&self.transport);
        let (started_tx, started_rx) = oneshot::channel();
        self.in_flight.spawn(async move {
            let _permit = permit;
            let _ = started_tx.send(());
            deliver(transport.as_ref(), items).await;
        });
        let _ = started_rx.await;
    }

    fn reap(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            if let Err(e) = result {
                LOGGER.error(format!("TelemetryChannel: delivery task failed: {}", e));
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(result) = self.in_flight.join_next().await {
            if let Err(e) = result {
                LOGGER.error(format!("TelemetryChannel: delivery task failed: {}", e));
            }
        }
    }
}

async fn deliver(transport: &dyn Transport, items: Vec<Envelope>) {
    let count = items.len();
    if let Err(e) = transport.send(items).await {
        LOGGER.error(format!(
            "TelemetryChannel: discarding batch of {} items: {}",
            count, e
        ));
    }
}

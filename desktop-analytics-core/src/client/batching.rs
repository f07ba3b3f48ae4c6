//! Queued backend
//!
//! Events are queued and a background loop delivers them when:
//! - the queue reaches the batch size threshold
//! - the flush interval expires
//! - flush is explicitly requested, or the client shuts down
//!
//! With neither a batch size nor an interval configured, every event is
//! delivered on its own as soon as it is queued.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::event::{Batch, Envelope, EventRecord, Properties};
use crate::stats::{DeliveryStatistics, StatisticsMonitor};

use super::{
    delivery_runtime, release_runtime, AnalyticsClient, BackendKind, ClientOptions,
    DeliveryNotice, DeliveryNotifier, Transport,
};

/// Batch size used when only a flush interval is configured
const DEFAULT_BATCH_SIZE: usize = 20;

enum Command {
    Enqueue(Envelope),
    Flush,
    Shutdown,
}

struct Running {
    runtime: Runtime,
    commands: mpsc::UnboundedSender<Command>,
}

/// Backend that queues events and delivers them in batches
pub struct BatchingClient<T: Transport> {
    transport: Option<T>,
    running: Mutex<Option<Running>>,
    monitor: Arc<StatisticsMonitor>,
    notifier: DeliveryNotifier,
}

impl<T: Transport> BatchingClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
            running: Mutex::new(None),
            monitor: Arc::new(StatisticsMonitor::new()),
            notifier: DeliveryNotifier::new(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let running = running.as_ref().ok_or(Error::NotInitialized)?;
        running
            .commands
            .send(command)
            .map_err(|_| Error::Delivery("delivery loop has stopped".to_string()))
    }
}

impl<T: Transport> AnalyticsClient for BatchingClient<T> {
    fn backend(&self) -> BackendKind {
        BackendKind::Batching
    }

    fn initialize(&mut self, options: &ClientOptions) -> Result<()> {
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| Error::Config("batching client already initialized".to_string()))?;
        transport.configure(options)?;

        let runtime = delivery_runtime(BackendKind::Batching)?;
        let (commands, receiver) = mpsc::unbounded_channel();

        let batch_size = match (options.batch_size, options.flush_interval) {
            (Some(size), _) => size.max(1),
            (None, Some(_)) => DEFAULT_BATCH_SIZE,
            (None, None) => 1,
        };
        let worker = DeliveryLoop {
            transport: Arc::new(transport),
            monitor: Arc::clone(&self.monitor),
            notifier: self.notifier.clone(),
            batch_size,
            queue: Vec::new(),
        };
        runtime.spawn(worker.run(receiver, options.flush_interval));

        tracing::debug!(
            batch_size,
            flush_interval = ?options.flush_interval,
            "Batching client initialized"
        );

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { runtime, commands });
        Ok(())
    }

    fn identify(
        &self,
        analytics_id: &str,
        traits: &Properties,
        context: &Properties,
    ) -> Result<()> {
        self.send(Command::Enqueue(Envelope::identify(
            analytics_id,
            traits,
            context,
        )))
    }

    fn track(&self, analytics_id: &str, event_name: &str, properties: Properties) -> Result<()> {
        let envelope = Envelope::track(
            analytics_id,
            EventRecord::with_properties(event_name, properties),
        );

        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let running = running.as_ref().ok_or(Error::NotInitialized)?;

        // Counted at enqueue time so statistics reflect intent to send.
        self.monitor.record_submission();
        if running.commands.send(Command::Enqueue(envelope)).is_err() {
            tracing::warn!(event = %event_name, "Delivery loop has stopped, event dropped");
            self.monitor.record_bulk_failure();
        }
        Ok(())
    }

    fn flush(&self) {
        if let Err(e) = self.send(Command::Flush) {
            tracing::debug!(error = %e, "Flush request ignored");
        }
    }

    fn shut_down(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Running { runtime, commands }) = running {
            let _ = commands.send(Command::Shutdown);
            drop(commands);
            release_runtime(runtime);
            tracing::debug!(stats = ?self.monitor.snapshot(), "Batching client shut down");
        }
    }

    fn statistics(&self) -> DeliveryStatistics {
        self.monitor.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.notifier.subscribe()
    }
}

impl<T: Transport> Drop for BatchingClient<T> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Background task owning the queue
struct DeliveryLoop<T: Transport> {
    transport: Arc<T>,
    monitor: Arc<StatisticsMonitor>,
    notifier: DeliveryNotifier,
    batch_size: usize,
    queue: Vec<Envelope>,
}

impl<T: Transport> DeliveryLoop<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        flush_interval: Option<Duration>,
    ) {
        let mut ticker = flush_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Enqueue(envelope)) => {
                        self.queue.push(envelope);
                        if self.queue.len() >= self.batch_size {
                            self.flush();
                        }
                    }
                    Some(Command::Flush) => self.flush(),
                    Some(Command::Shutdown) | None => {
                        self.flush();
                        break;
                    }
                },
                _ = next_tick(&mut ticker) => self.flush(),
            }
        }
    }

    /// Hand the queued envelopes to a delivery task
    fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let batch = Batch {
            envelopes: std::mem::take(&mut self.queue),
        };
        tokio::spawn(deliver(
            Arc::clone(&self.transport),
            Arc::clone(&self.monitor),
            self.notifier.clone(),
            batch,
        ));
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn deliver<T: Transport>(
    transport: Arc<T>,
    monitor: Arc<StatisticsMonitor>,
    notifier: DeliveryNotifier,
    batch: Batch,
) {
    let tracked = batch.track_count();
    let size = batch.len();

    match transport.deliver(batch).await {
        Ok(()) => {
            for _ in 0..tracked {
                monitor.record_success();
            }
            tracing::debug!(size, tracked, "Delivered batch");
            notifier.succeeded(tracked);
        }
        Err(e) => {
            tracing::warn!(size, error = %e, "Failed to deliver batch");
            monitor.record_bulk_failure();
            notifier.failed(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::thread;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        batches: Arc<Mutex<Vec<Batch>>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        fn deliver(&self, batch: Batch) -> impl Future<Output = Result<()>> + Send {
            self.batches.lock().unwrap().push(batch);
            let fail = self.fail;
            async move {
                if fail {
                    Err(Error::Delivery("HTTP request failed: connection refused".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_track_before_initialize_is_rejected() {
        let client = BatchingClient::new(RecordingTransport::default());
        assert!(matches!(
            client.track("id", "Event", Properties::new()),
            Err(Error::NotInitialized)
        ));
        assert_eq!(client.statistics(), DeliveryStatistics::default());
    }

    #[test]
    fn test_unbatched_delivers_each_event() {
        let transport = RecordingTransport::default();
        let batches = Arc::clone(&transport.batches);
        let mut client = BatchingClient::new(transport);
        client.initialize(&ClientOptions::new("secret")).unwrap();

        client.track("id", "One", Properties::new()).unwrap();
        client.track("id", "Two", Properties::new()).unwrap();
        assert_eq!(client.statistics().submitted, 2);

        wait_until(|| client.statistics().succeeded == 2);
        assert_eq!(client.statistics(), DeliveryStatistics::new(2, 2, 0));
        assert!(batches.lock().unwrap().iter().all(|b| b.len() == 1));
        client.shut_down();
    }

    #[test]
    fn test_batch_size_threshold() {
        let transport = RecordingTransport::default();
        let batches = Arc::clone(&transport.batches);
        let mut client = BatchingClient::new(transport);
        let options = ClientOptions {
            batch_size: Some(3),
            ..ClientOptions::new("secret")
        };
        client.initialize(&options).unwrap();

        client.track("id", "One", Properties::new()).unwrap();
        client.track("id", "Two", Properties::new()).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(batches.lock().unwrap().is_empty());

        client.track("id", "Three", Properties::new()).unwrap();
        wait_until(|| client.statistics().succeeded == 3);
        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(batches.lock().unwrap()[0].len(), 3);
        client.shut_down();
    }

    #[test]
    fn test_explicit_flush_sends_partial_batch() {
        let transport = RecordingTransport::default();
        let mut client = BatchingClient::new(transport);
        let options = ClientOptions {
            batch_size: Some(50),
            ..ClientOptions::new("secret")
        };
        client.initialize(&options).unwrap();

        client.track("id", "One", Properties::new()).unwrap();
        client.flush();
        wait_until(|| client.statistics().succeeded == 1);
        client.shut_down();
    }

    #[test]
    fn test_flush_interval_sends_partial_batch() {
        let transport = RecordingTransport::default();
        let batches = Arc::clone(&transport.batches);
        let mut client = BatchingClient::new(transport);
        let options = ClientOptions {
            batch_size: Some(50),
            flush_interval: Some(Duration::from_secs(1)),
            ..ClientOptions::new("secret")
        };
        client.initialize(&options).unwrap();

        client.track("id", "One", Properties::new()).unwrap();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(client.statistics(), DeliveryStatistics::new(1, 0, 0));
        assert!(batches.lock().unwrap().is_empty());

        thread::sleep(Duration::from_millis(1000));
        wait_until(|| client.statistics().succeeded == 1);
        assert_eq!(batches.lock().unwrap().len(), 1);
        client.shut_down();
    }

    #[test]
    fn test_identify_is_not_counted() {
        let transport = RecordingTransport::default();
        let batches = Arc::clone(&transport.batches);
        let mut client = BatchingClient::new(transport);
        client.initialize(&ClientOptions::new("secret")).unwrap();

        client
            .identify("id", &Properties::new(), &Properties::new())
            .unwrap();
        wait_until(|| batches.lock().unwrap().len() == 1);
        assert_eq!(client.statistics(), DeliveryStatistics::default());
        client.shut_down();
    }

    #[test]
    fn test_failure_charges_outstanding_and_notifies() {
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let mut client = BatchingClient::new(transport);
        let mut notices = client.subscribe();
        client.initialize(&ClientOptions::new("secret")).unwrap();

        client.track("id", "One", Properties::new()).unwrap();
        wait_until(|| client.statistics().failed == 1);
        assert_eq!(client.statistics(), DeliveryStatistics::new(1, 0, 1));

        let mut notice = None;
        wait_until(|| {
            notice = notices.try_recv().ok();
            notice.is_some()
        });
        assert!(matches!(notice, Some(DeliveryNotice::Failed { .. })));
        client.shut_down();
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let mut client = BatchingClient::new(RecordingTransport::default());
        client.initialize(&ClientOptions::new("secret")).unwrap();
        assert!(matches!(
            client.initialize(&ClientOptions::new("secret")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_track_after_shutdown_is_rejected() {
        let mut client = BatchingClient::new(RecordingTransport::default());
        client.initialize(&ClientOptions::new("secret")).unwrap();
        client.shut_down();
        client.shut_down();
        assert!(matches!(
            client.track("id", "Late", Properties::new()),
            Err(Error::NotInitialized)
        ));
    }
}

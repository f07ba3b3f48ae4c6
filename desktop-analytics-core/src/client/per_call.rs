//! One-request-per-call backend
//!
//! Every track and identify call becomes its own delivery task. Statistics
//! are computed by scanning those tasks: finished and delivered counts as
//! succeeded, finished otherwise (failed, cancelled) counts as failed.
//! Finished tasks are folded into running totals and forgotten.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{Batch, Envelope, EventRecord, Properties};
use crate::stats::DeliveryStatistics;

use super::{
    delivery_runtime, release_runtime, AnalyticsClient, BackendKind, ClientOptions,
    DeliveryNotice, DeliveryNotifier, Transport,
};

struct Running<T: Transport> {
    runtime: Runtime,
    transport: Arc<T>,
}

/// A submitted request and, once known, whether it was delivered
struct Request {
    handle: JoinHandle<()>,
    delivered: Arc<OnceLock<bool>>,
}

/// Settled totals plus the requests still in flight
#[derive(Default)]
struct Ledger {
    submitted: u64,
    succeeded: u64,
    failed: u64,
    pending: Vec<Request>,
}

impl Ledger {
    fn settle(&mut self) {
        let Ledger {
            succeeded,
            failed,
            pending,
            ..
        } = self;
        pending.retain(|request| {
            if !request.handle.is_finished() {
                return true;
            }
            match request.delivered.get() {
                Some(true) => *succeeded += 1,
                _ => *failed += 1,
            }
            false
        });
    }

    fn snapshot(&self) -> DeliveryStatistics {
        DeliveryStatistics::new(self.submitted, self.succeeded, self.failed)
    }
}

/// Backend issuing one independent request per call
pub struct PerCallClient<T: Transport> {
    transport: Option<T>,
    running: Mutex<Option<Running<T>>>,
    requests: Mutex<Ledger>,
    notifier: DeliveryNotifier,
}

impl<T: Transport> PerCallClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
            running: Mutex::new(None),
            requests: Mutex::new(Ledger::default()),
            notifier: DeliveryNotifier::new(),
        }
    }

    fn submit(&self, envelope: Envelope) -> Result<()> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let running = running.as_ref().ok_or(Error::NotInitialized)?;

        let transport = Arc::clone(&running.transport);
        let notifier = self.notifier.clone();
        let delivered = Arc::new(OnceLock::new());
        let outcome = Arc::clone(&delivered);
        let tracked = usize::from(envelope.is_track());

        let handle = running.runtime.spawn(async move {
            let ok = match transport.deliver(Batch::single(envelope)).await {
                Ok(()) => {
                    notifier.succeeded(tracked);
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to deliver request");
                    notifier.failed(&e);
                    false
                }
            };
            let _ = outcome.set(ok);
        });

        let mut ledger = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.submitted += 1;
        ledger.pending.push(Request { handle, delivered });
        ledger.settle();
        Ok(())
    }
}

impl<T: Transport> AnalyticsClient for PerCallClient<T> {
    fn backend(&self) -> BackendKind {
        BackendKind::PerCall
    }

    fn initialize(&mut self, options: &ClientOptions) -> Result<()> {
        if options.host.is_some() {
            return Err(Error::HostNotSupported {
                backend: BackendKind::PerCall,
            });
        }

        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| Error::Config("per-call client already initialized".to_string()))?;
        transport.configure(options)?;

        let runtime = delivery_runtime(BackendKind::PerCall)?;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            runtime,
            transport: Arc::new(transport),
        });
        tracing::debug!("Per-call client initialized");
        Ok(())
    }

    fn identify(
        &self,
        analytics_id: &str,
        traits: &Properties,
        context: &Properties,
    ) -> Result<()> {
        self.submit(Envelope::identify(analytics_id, traits, context))
    }

    fn track(&self, analytics_id: &str, event_name: &str, properties: Properties) -> Result<()> {
        self.submit(Envelope::track(
            analytics_id,
            EventRecord::with_properties(event_name, properties),
        ))
    }

    /// Requests are already in flight; nothing to accelerate.
    fn flush(&self) {}

    fn shut_down(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            release_runtime(running.runtime);
            tracing::debug!(stats = ?self.statistics(), "Per-call client shut down");
        }
    }

    fn statistics(&self) -> DeliveryStatistics {
        let mut ledger = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.settle();
        ledger.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.notifier.subscribe()
    }
}

impl<T: Transport> Drop for PerCallClient<T> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

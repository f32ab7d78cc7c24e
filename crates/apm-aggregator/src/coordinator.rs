// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-consumer fan-in loop owning the current window.
//!
//! Producers talk to the [`EventCoordinator`] through a [`CoordinatorHandle`]. Each event kind has
//! its own bounded queue, so a full queue makes that producer wait instead of dropping events. The
//! coordinator services one message per loop iteration and is the only writer of the batch, the
//! tick counter, the activity flag and the negotiated features.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::aggregator::batch::{BatchStats, WindowBatch};
use crate::config::store::ConfigStore;
use crate::config::Config;
use crate::constants::ACTIVE_IDLE_TICKS;
use crate::errors::SendError;
use crate::flusher::{FeatureFlags, FlushContext, FlushOutcome, Flusher};
use crate::model::{ErrorCaptured, MetricsSnapshot, SpanFinished, TransactionFinished};

#[derive(Debug)]
pub enum ControlCommand {
    /// Closes the window now, as a timer tick would, and answers once its flush has finished.
    Flush(oneshot::Sender<FlushOutcome>),
    Stats(oneshot::Sender<BatchStats>),
}

/// Cloneable producer side of the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    transactions: mpsc::Sender<TransactionFinished>,
    spans: mpsc::Sender<SpanFinished>,
    errors: mpsc::Sender<ErrorCaptured>,
    metrics: mpsc::Sender<MetricsSnapshot>,
    control: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    /// Queues a finished transaction, waiting while the queue is full.
    pub async fn send_transaction(&self, event: TransactionFinished) -> Result<(), SendError> {
        self.transactions
            .send(event)
            .await
            .map_err(|_| SendError::Closed("transaction"))
    }

    pub async fn send_span(&self, event: SpanFinished) -> Result<(), SendError> {
        self.spans
            .send(event)
            .await
            .map_err(|_| SendError::Closed("span"))
    }

    pub async fn send_error(&self, event: ErrorCaptured) -> Result<(), SendError> {
        self.errors
            .send(event)
            .await
            .map_err(|_| SendError::Closed("error"))
    }

    pub async fn send_metrics(&self, snapshot: MetricsSnapshot) -> Result<(), SendError> {
        self.metrics
            .send(snapshot)
            .await
            .map_err(|_| SendError::Closed("metrics"))
    }

    /// Blocking variant of [`Self::send_transaction`] for threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_send_transaction(&self, event: TransactionFinished) -> Result<(), SendError> {
        self.transactions
            .blocking_send(event)
            .map_err(|_| SendError::Closed("transaction"))
    }

    pub fn blocking_send_span(&self, event: SpanFinished) -> Result<(), SendError> {
        self.spans
            .blocking_send(event)
            .map_err(|_| SendError::Closed("span"))
    }

    pub fn blocking_send_error(&self, event: ErrorCaptured) -> Result<(), SendError> {
        self.errors
            .blocking_send(event)
            .map_err(|_| SendError::Closed("error"))
    }

    pub fn blocking_send_metrics(&self, snapshot: MetricsSnapshot) -> Result<(), SendError> {
        self.metrics
            .blocking_send(snapshot)
            .map_err(|_| SendError::Closed("metrics"))
    }

    /// Forces a tick and waits for the resulting flush to finish.
    pub async fn flush(&self) -> Result<FlushOutcome, SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control
            .send(ControlCommand::Flush(response_tx))
            .await
            .map_err(|_| SendError::Closed("flush"))?;
        response_rx.await.map_err(|_| SendError::NoResponse("flush"))
    }

    /// Counts of what the live window holds.
    pub async fn stats(&self) -> Result<BatchStats, SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control
            .send(ControlCommand::Stats(response_tx))
            .await
            .map_err(|_| SendError::Closed("stats"))?;
        response_rx.await.map_err(|_| SendError::NoResponse("stats"))
    }

    /// Stops the coordinator. Queued events and the live window are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct EventCoordinator {
    config: Arc<Config>,
    store: ConfigStore,
    flusher: Arc<Flusher>,
    batch: WindowBatch,
    tick: u64,
    idle_ticks: u64,
    active: bool,
    features: FeatureFlags,
    /// Tick whose host-info report set `features`.
    features_tick: Option<u64>,
    transactions_rx: mpsc::Receiver<TransactionFinished>,
    spans_rx: mpsc::Receiver<SpanFinished>,
    errors_rx: mpsc::Receiver<ErrorCaptured>,
    metrics_rx: mpsc::Receiver<MetricsSnapshot>,
    control_rx: mpsc::Receiver<ControlCommand>,
    features_tx: mpsc::UnboundedSender<(u64, FeatureFlags)>,
    features_rx: mpsc::UnboundedReceiver<(u64, FeatureFlags)>,
    cancel: CancellationToken,
}

impl EventCoordinator {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: ConfigStore,
        flusher: Arc<Flusher>,
    ) -> (Self, CoordinatorHandle) {
        let capacity = config.event_queue_capacity.max(1);
        let (transactions, transactions_rx) = mpsc::channel(capacity);
        let (spans, spans_rx) = mpsc::channel(capacity);
        let (errors, errors_rx) = mpsc::channel(capacity);
        let (metrics, metrics_rx) = mpsc::channel(capacity);
        let (control, control_rx) = mpsc::channel(16);
        let (features_tx, features_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let coordinator = EventCoordinator {
            config,
            store,
            flusher,
            batch: WindowBatch::new(),
            tick: 0,
            idle_ticks: 0,
            active: false,
            features: FeatureFlags::default(),
            features_tick: None,
            transactions_rx,
            spans_rx,
            errors_rx,
            metrics_rx,
            control_rx,
            features_tx,
            features_rx,
            cancel: cancel.clone(),
        };
        let handle = CoordinatorHandle {
            transactions,
            spans,
            errors,
            metrics,
            control,
            cancel,
        };
        (coordinator, handle)
    }

    pub async fn run(mut self) {
        debug!("AGGREGATOR | coordinator started");
        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(event) = self.transactions_rx.recv() => self.on_transaction(&event),
                Some(event) = self.spans_rx.recv() => self.on_span(event),
                Some(event) = self.errors_rx.recv() => self.on_error(&event),
                Some(snapshot) = self.metrics_rx.recv() => self.batch.add_metrics(snapshot),
                Some((tick, features)) = self.features_rx.recv() => self.on_features(tick, features),
                Some(command) = self.control_rx.recv() => match command {
                    ControlCommand::Flush(response_tx) => self.on_tick(Some(response_tx)),
                    ControlCommand::Stats(response_tx) => {
                        if response_tx.send(self.batch.stats()).is_err() {
                            error!("AGGREGATOR | failed to send stats response - receiver dropped");
                        }
                    }
                },
                _ = ticker.tick() => self.on_tick(None),
            }
        }

        debug!(
            "AGGREGATOR | coordinator stopped, dropping {:?}",
            self.batch.stats()
        );
    }

    fn on_transaction(&mut self, event: &TransactionFinished) {
        let snapshot = self.store.load();
        if !snapshot.values().recording {
            return;
        }
        let analytics = self.features.analytics && self.config.analytics;
        self.batch
            .add_transaction(event, snapshot.values(), analytics);
    }

    fn on_span(&mut self, event: SpanFinished) {
        if self.store.load().values().recording {
            self.batch.add_span(event);
        }
    }

    fn on_error(&mut self, event: &ErrorCaptured) {
        let snapshot = self.store.load();
        if snapshot.values().recording {
            self.batch.add_error(event, snapshot.values());
        }
    }

    /// Applies a host-info report unless a later tick has already reported.
    fn on_features(&mut self, tick: u64, features: FeatureFlags) {
        if let Some(applied) = self.features_tick.filter(|&applied| applied > tick) {
            debug!("AGGREGATOR | discarding features from tick {tick}, tick {applied} is newer");
            return;
        }
        debug!("AGGREGATOR | applying features from tick {tick}: {features:?}");
        self.features = features;
        self.features_tick = Some(tick);
    }

    /// Closes the current window and hands it to a detached flush task.
    fn on_tick(&mut self, response_tx: Option<oneshot::Sender<FlushOutcome>>) {
        let tick = self.tick;
        self.tick += 1;

        self.idle_ticks += 1;
        if self.idle_ticks >= ACTIVE_IDLE_TICKS {
            self.active = false;
        }
        let ctx = FlushContext {
            tick,
            features: self.features,
            active: self.active,
        };

        let batch = std::mem::replace(&mut self.batch, WindowBatch::new());
        if batch.has_data() {
            self.active = true;
            self.idle_ticks = 0;
        }

        // Flushes are not awaited; a slow one may still be running when the next starts.
        // Feature reports can therefore arrive out of tick order and are tagged with their tick.
        let flusher = Arc::clone(&self.flusher);
        let features_tx = self.features_tx.clone();
        tokio::spawn(async move {
            let outcome = flusher.flush(batch, ctx).await;
            if let Some(features) = outcome.features {
                if features_tx.send((tick, features)).is_err() {
                    debug!("AGGREGATOR | coordinator gone, discarding negotiated features");
                }
            }
            if let Some(response_tx) = response_tx {
                if response_tx.send(outcome).is_err() {
                    error!("AGGREGATOR | failed to send flush response - receiver dropped");
                }
            }
        });
    }
}

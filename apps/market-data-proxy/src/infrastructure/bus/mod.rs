//! Message Bus
//!
//! Carries normalized ticks and adapter lifecycle events from upstream
//! adapter tasks to the event loop.
//!
//! # Lanes
//!
//! - **Tick lane**: a bounded tokio broadcast channel. When the consumer
//!   falls behind, the oldest ticks are overwritten and the consumer learns
//!   how many it missed; those are added to the drop counter. Producers
//!   never wait.
//! - **Control lane**: an unbounded mpsc channel. Lifecycle events are rare
//!   and must not be lost, so they bypass the tick lane's eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc};

use crate::application::ports::{AdapterEvent, MarketEventSink};
use crate::domain::market_data::Tick;
use crate::infrastructure::metrics;

/// Default tick lane capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 16_384;

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Bus counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Ticks accepted by the tick lane.
    pub published: u64,
    /// Ticks evicted before the consumer read them.
    pub dropped: u64,
}

/// Create a bus with the given tick lane capacity.
///
/// tokio rounds broadcast capacity up to a power of two, so the effective
/// bound may be larger than requested.
#[must_use]
pub fn message_bus(capacity: usize) -> (BusPublisher, BusConsumer) {
    let (ticks_tx, ticks_rx) = broadcast::channel(capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());

    let publisher = BusPublisher {
        ticks: ticks_tx,
        events: events_tx,
        counters: Arc::clone(&counters),
    };
    let consumer = BusConsumer {
        ticks: TickReceiver {
            ticks: ticks_rx,
            counters,
        },
        events: EventReceiver { events: events_rx },
    };
    (publisher, consumer)
}

// =============================================================================
// Publisher
// =============================================================================

/// Producer side; cloned into every adapter.
#[derive(Debug, Clone)]
pub struct BusPublisher {
    ticks: broadcast::Sender<Arc<Tick>>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    counters: Arc<Counters>,
}

impl BusPublisher {
    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl MarketEventSink for BusPublisher {
    fn publish_tick(&self, tick: Tick) {
        // Without a consumer the process is shutting down
        if self.ticks.send(Arc::new(tick)).is_ok() {
            self.counters.published.fetch_add(1, Ordering::Relaxed);
            metrics::record_bus_published();
        }
    }

    fn publish_event(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Control lane closed, adapter event discarded");
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Consumer side, owned by the event loop.
///
/// The two lanes are polled concurrently, so [`BusConsumer::into_parts`]
/// hands them out as separate receivers.
#[derive(Debug)]
pub struct BusConsumer {
    ticks: TickReceiver,
    events: EventReceiver,
}

impl BusConsumer {
    /// Next tick, skipping over any that were evicted.
    pub async fn recv_tick(&mut self) -> Option<Arc<Tick>> {
        self.ticks.recv().await
    }

    /// Next lifecycle event.
    pub async fn recv_event(&mut self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.ticks.stats()
    }

    /// Split into the tick lane and the control lane.
    #[must_use]
    pub fn into_parts(self) -> (TickReceiver, EventReceiver) {
        (self.ticks, self.events)
    }
}

/// Receiving end of the tick lane. Owns the drop counter.
#[derive(Debug)]
pub struct TickReceiver {
    ticks: broadcast::Receiver<Arc<Tick>>,
    counters: Arc<Counters>,
}

impl TickReceiver {
    /// Next tick, skipping over any that were evicted.
    ///
    /// Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Arc<Tick>> {
        loop {
            match self.ticks.recv().await {
                Ok(tick) => return Some(tick),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.counters.dropped.fetch_add(missed, Ordering::Relaxed);
                    metrics::record_bus_dropped(missed);
                    tracing::warn!(missed, "Event loop lagging, oldest ticks dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of the control lane.
#[derive(Debug)]
pub struct EventReceiver {
    events: mpsc::UnboundedReceiver<AdapterEvent>,
}

impl EventReceiver {
    /// Next lifecycle event. Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<AdapterEvent> {
        self.events.recv().await
    }
}

// =============================================================================
// Tests
// =============================================================================

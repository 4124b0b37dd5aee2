//! Event Loop
//!
//! The only owner of routing state. One task selects over, in priority
//! order: shutdown, adapter lifecycle events, client commands, the
//! maintenance timer and bus ticks. Every mutation of the registry, the
//! pools and the throttle happens here, so none of them needs a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::connection::ServerCommand;
use crate::application::ports::{AdapterEvent, Outbound, Reply};
use crate::application::services::{MaintenanceReport, ProxyCore, RouteOutcome};
use crate::domain::market_data::Tick;
use crate::infrastructure::bus::{BusConsumer, EventReceiver, TickReceiver};
use crate::infrastructure::health::{HealthSnapshot, SharedHealth};
use crate::infrastructure::metrics;

/// Core specialised to per-client channel sinks.
pub type ChannelCore = ProxyCore<mpsc::Sender<Outbound>>;

/// The routing event loop.
pub struct EventLoop {
    core: ChannelCore,
    ticks: TickReceiver,
    events: EventReceiver,
    commands: mpsc::Receiver<ServerCommand>,
    health: SharedHealth,
    maintenance_interval: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("core", &self.core)
            .field("maintenance_interval", &self.maintenance_interval)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Create an event loop.
    #[must_use]
    pub fn new(
        core: ChannelCore,
        bus: BusConsumer,
        commands: mpsc::Receiver<ServerCommand>,
        health: SharedHealth,
        maintenance_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (ticks, events) = bus.into_parts();
        Self {
            core,
            ticks,
            events,
            commands,
            health,
            maintenance_interval,
            cancel,
        }
    }

    /// Run until cancelled, then release every session and connection.
    pub async fn run(mut self) {
        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks_open = true;
        let mut events_open = true;
        let mut commands_open = true;

        tracing::info!(
            maintenance_ms = u64::try_from(self.maintenance_interval.as_millis()).unwrap_or(u64::MAX),
            "Event loop started"
        );
        self.publish_state();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.on_adapter_event(&event),
                    None => events_open = false,
                },

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => commands_open = false,
                },

                _ = maintenance.tick() => self.on_maintenance(),

                tick = self.ticks.recv(), if ticks_open => match tick {
                    Some(tick) => self.on_tick(&tick),
                    None => ticks_open = false,
                },
            }
        }

        tracing::info!("Event loop stopping");
        self.core.shutdown();
        self.publish_state();
    }

    fn on_command(&mut self, command: ServerCommand) {
        let now = Instant::now();
        match command {
            ServerCommand::Register {
                client_id,
                user_id,
                sink,
            } => {
                if let Err(e) = self.core.register(client_id, &user_id, sink) {
                    tracing::warn!(client_id = %client_id, error = %e, "Session registration refused");
                }
            }
            ServerCommand::Subscribe {
                client_id,
                items,
                mode,
            } => match self.core.subscribe(client_id, &items, mode, now) {
                Ok(Reply::Subscribed { rejected, .. }) => {
                    for entry in &rejected {
                        metrics::record_subscription_rejected(entry.reason);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(client_id = %client_id, error = %e, "Subscribe for unknown session"),
            },
            ServerCommand::Unsubscribe {
                client_id,
                items,
                mode,
            } => {
                if let Err(e) = self.core.unsubscribe(client_id, &items, mode, now) {
                    tracing::debug!(client_id = %client_id, error = %e, "Unsubscribe for unknown session");
                }
            }
            ServerCommand::Logout { client_id } => {
                self.core.logout(client_id, now);
            }
            ServerCommand::Ping { client_id } => self.core.pong(client_id),
            ServerCommand::Disconnect { client_id } => {
                self.core.disconnect(client_id, now);
            }
        }
    }

    fn on_tick(&mut self, tick: &Arc<Tick>) {
        let started = Instant::now();
        match self.core.route_tick(tick, started) {
            RouteOutcome::NoSubscribers => {}
            RouteOutcome::Throttled => metrics::record_throttled(),
            RouteOutcome::Delivered {
                delivered,
                dropped,
                disconnected,
            } => {
                metrics::record_fan_out(delivered, dropped, started.elapsed());
                if dropped > 0 {
                    tracing::debug!(key = %tick.key, dropped, "Client queues full, tick dropped");
                }
                if !disconnected.is_empty() {
                    tracing::debug!(key = %tick.key, count = disconnected.len(), "Closed sessions removed during fan-out");
                }
            }
        }
    }

    fn on_adapter_event(&mut self, event: &AdapterEvent) {
        tracing::debug!(
            provider = %event.provider,
            connection_index = event.connection_index,
            event = ?event.kind,
            "Adapter event"
        );
        self.core.handle_adapter_event(event);
        self.publish_state();
    }

    fn on_maintenance(&mut self) {
        let report = self.core.run_maintenance(Instant::now());
        if report != MaintenanceReport::default() {
            tracing::debug!(
                released = report.released,
                closed_connections = report.closed_connections,
                reopened_connections = report.reopened_connections,
                "Maintenance pass"
            );
        }
        self.publish_state();
    }

    /// Refresh gauges and the health snapshot.
    fn publish_state(&self) {
        let stats = self.core.stats();
        let pools = self.core.pool_snapshots();

        metrics::set_sessions(stats.clients, stats.routing_keys);
        for pool in &pools {
            metrics::set_pool(
                &pool.provider,
                pool.connections.len(),
                pool.connected(),
                pool.bound_symbols(),
            );
        }

        *self.health.write() = HealthSnapshot {
            clients: stats.clients,
            routing_keys: stats.routing_keys,
            bus: self.ticks.stats(),
            pools,
        };
    }
}

//! Routing-update consumer.
//!
//! Pulls events one at a time in delivery order, translates each into a
//! controller call sequence, and acknowledges it only once the whole sequence
//! succeeded. A failing event stops the batch; it and everything behind it
//! are fetched again after the poll interval.

use std::time::Duration;

use anyhow::{bail, Result};
use lbsync_events::{RawEnvelope, RoutingAction, RoutingUpdate};
use lbsync_reconcile::{Checkpoint, RetryTracker, DEFAULT_RETRY_WINDOW};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::controller::Controller;
use crate::error::{LbError, ObjectKind};
use crate::model::{Backend, Member};
use crate::naming::{MonitorTemplate, Naming};
use crate::source::EventSource;

/// How routing updates map onto controller calls.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub naming: Naming,
    pub create_routes: bool,
    pub monitor: Option<MonitorTemplate>,
    pub poll_interval: Duration,
    pub once: bool,
    pub max_event_retries: u32,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            naming: config.naming.clone(),
            create_routes: config.create_routes,
            monitor: config.monitor.clone(),
            poll_interval: config.poll_interval,
            once: config.once,
            max_event_retries: config.max_event_retries,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            naming: Naming::default(),
            create_routes: true,
            monitor: None,
            poll_interval: Duration::from_secs(1),
            once: false,
            max_event_retries: lbsync_reconcile::DEFAULT_MAX_RETRIES,
        }
    }
}

/// What happened to one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The controller call sequence completed.
    Applied,
    /// Already acknowledged earlier; acknowledged again without applying.
    Duplicate,
    /// The payload cannot be decoded; acknowledged and dropped.
    Malformed,
}

/// The event that stopped a batch.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event_id: i64,
    pub error: LbError,
}

/// Result of one fetch-and-apply round.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub fetched: usize,
    pub acknowledged: usize,
    pub failed: Option<FailedEvent>,
}

/// Single-worker consumer driving one controller.
pub struct RoutingConsumer<B, S> {
    controller: Controller<B>,
    source: S,
    settings: ConsumerSettings,
    checkpoint: Checkpoint,
    retries: RetryTracker,
}

impl<B: Backend, S: EventSource> RoutingConsumer<B, S> {
    pub fn new(controller: Controller<B>, source: S, settings: ConsumerSettings) -> Self {
        let checkpoint = Checkpoint::new(source.acknowledged());
        let retries = RetryTracker::new(settings.max_event_retries, DEFAULT_RETRY_WINDOW);
        Self {
            controller,
            source,
            settings,
            checkpoint,
            retries,
        }
    }

    pub fn controller(&self) -> &Controller<B> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller<B> {
        &mut self.controller
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Consecutive failures recorded for an event.
    pub fn failure_count(&self, event_id: i64) -> u32 {
        self.retries.failure_count(&event_id.to_string())
    }

    /// Translate one routing update into controller calls.
    pub async fn apply(&mut self, update: &RoutingUpdate) -> Result<(), LbError> {
        let app = update.app_name.as_str();
        let ns = update.namespace.as_str();
        let pool = self.settings.naming.pool_name(app, ns);

        match update.action {
            RoutingAction::CreateApplication => {
                let monitor = match &self.settings.monitor {
                    Some(template) => {
                        let spec = template.render(app, ns);
                        if !self.controller.has_monitor(&spec.name).await? {
                            self.controller.create_monitor(&spec).await?;
                        }
                        Some(spec.name)
                    }
                    None => None,
                };

                // Steps already present on the backend are from an earlier,
                // partly applied delivery of this event.
                if self.controller.has_pool(&pool).await? {
                    debug!(pool = %pool, "pool already present");
                } else {
                    self.controller.create_pool(&pool, monitor.as_deref()).await?;
                }

                if self.settings.create_routes {
                    let route = self.settings.naming.route_name(app, ns);
                    if self.controller.has_route(&route).await? {
                        debug!(route = %route, "route already present");
                        self.controller.attach_route(&route).await?;
                    } else {
                        let path = self.settings.naming.route_path(app);
                        self.controller.create_route(&pool, &route, &path).await?;
                    }
                }
            }

            RoutingAction::DeleteApplication => {
                let route = self.settings.naming.route_name(app, ns);
                if self.controller.has_route(&route).await? {
                    self.controller.delete_route(&pool, &route).await?;
                }

                self.controller.delete_pool(&pool).await?;

                if let Some(template) = self
                    .settings
                    .monitor
                    .as_ref()
                    .filter(|t| t.is_per_application())
                {
                    let name = template.render(app, ns).name;
                    if self.controller.has_monitor(&name).await? {
                        self.controller.delete_monitor(&name, None).await?;
                    }
                }
            }

            RoutingAction::AddGear | RoutingAction::RemoveGear => {
                let Some(gear) = update.gear() else {
                    return Err(LbError::invalid_reference(
                        ObjectKind::Member,
                        "(missing address)",
                        format!("{} event for {app}/{ns}", update.action),
                    ));
                };
                let member = Member::from(gear);

                let mut handle = self.controller.pool(&pool).await?;
                if update.action == RoutingAction::AddGear {
                    handle.add_member(&member.address, member.port).await?;
                } else {
                    handle.delete_member(&member.address, member.port).await?;
                }
            }
        }

        Ok(())
    }

    /// Decode and apply one delivered event. Does not acknowledge.
    pub async fn handle(&mut self, envelope: &RawEnvelope) -> Result<EventOutcome, LbError> {
        if self.checkpoint.is_processed(envelope.event_id) {
            debug!(event_id = envelope.event_id, "event already acknowledged");
            return Ok(EventOutcome::Duplicate);
        }

        let event = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    event_id = envelope.event_id,
                    error = %e,
                    payload = %envelope.payload,
                    "dropping undecodable routing update"
                );
                return Ok(EventOutcome::Malformed);
            }
        };

        let update = &event.payload;
        if let Err(e) = self.apply(update).await {
            warn!(
                event_id = event.event_id,
                action = %update.action,
                app_name = %update.app_name,
                namespace = %update.namespace,
                reason = e.reason_code(),
                logical = e.is_logical(),
                error = %e,
                "routing update failed; left unacknowledged"
            );
            return Err(e);
        }

        info!(
            event_id = event.event_id,
            action = %update.action,
            app_name = %update.app_name,
            namespace = %update.namespace,
            "routing update applied"
        );
        Ok(EventOutcome::Applied)
    }

    /// Fetch one batch and work through it in order, stopping at the first
    /// failure.
    pub async fn poll_once(&mut self) -> Result<BatchReport> {
        let batch = self.source.fetch().await?;
        let mut report = BatchReport {
            fetched: batch.len(),
            ..BatchReport::default()
        };

        for envelope in batch {
            let event_id = envelope.event_id;
            let key = event_id.to_string();

            match self.handle(&envelope).await {
                Ok(_) => {
                    self.source.ack(event_id).await?;
                    self.checkpoint.advance(event_id);
                    self.retries.clear(&key);
                    report.acknowledged += 1;
                }
                Err(err) => {
                    let exhausted = self.retries.record_failure(&key);
                    let failures = self.retries.failure_count(&key);
                    if exhausted {
                        error!(
                            event_id,
                            failures,
                            reason = err.reason_code(),
                            logical = err.is_logical(),
                            error = %err,
                            "routing update keeps failing; operator attention required"
                        );
                    } else {
                        debug!(
                            event_id,
                            failures,
                            logical = err.is_logical(),
                            "routing update will be retried"
                        );
                    }
                    report.failed = Some(FailedEvent {
                        event_id,
                        error: err,
                    });
                    break;
                }
            }
        }

        self.retries.prune();
        Ok(report)
    }

    /// Consume until shutdown is signalled (or, with `once`, until the feed
    /// is drained).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            checkpoint = self.checkpoint.last_event_id,
            driver = self.controller.backend().driver_name(),
            "routing consumer started"
        );

        loop {
            if *shutdown.borrow() {
                info!(checkpoint = self.checkpoint.last_event_id, "routing consumer stopped");
                return Ok(());
            }

            let report = match self.poll_once().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, checkpoint = self.checkpoint.last_event_id, "failed to fetch events; retrying");
                    if idle(self.settings.poll_interval, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if let Some(failed) = report.failed {
                if self.settings.once {
                    bail!(
                        "routing update {} failed: {}",
                        failed.event_id,
                        failed.error
                    );
                }
                if idle(self.settings.poll_interval, &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }

            if report.fetched == 0 {
                if self.settings.once {
                    info!(checkpoint = self.checkpoint.last_event_id, "sync complete");
                    return Ok(());
                }
                if idle(self.settings.poll_interval, &mut shutdown).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Sleep for `interval`. Returns true if shutdown was requested in the
/// meantime.
async fn idle(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        changed = shutdown.changed() => {
            if changed.is_err() {
                return true;
            }
        }
    }
    *shutdown.borrow()
}

//! Per-device supervisor: poll loop, price gate task and report channel.
//!
//! Devices share nothing. Each one owns its link, reconciler and debounce
//! timer, and talks to the rest of the process only through channels.

use crate::clock::MonotonicClock;
use crate::config::DeviceConfig;
use crate::error::CycleError;
use crate::link::RegisterLink;
use crate::policy::PolicyState;
use crate::price::PriceSample;
use crate::price_gate::{run_price_gate, PriceEvent, PriceGate, PriceView, PRICE_DEBOUNCE};
use crate::reconciler::{LimitReconciler, ReconcileOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const PRICE_QUEUE: usize = 32;

/// Everything the host surface shows for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceReport {
    pub device: String,
    pub available: bool,
    pub export_limit_w: Option<u16>,
    pub grid_max_w: Option<u16>,
    pub curtailed: Option<bool>,
    pub current_price: Option<f64>,
    pub price_curtail: bool,
    pub automation_enabled: bool,
    pub manual_limit_w: Option<u16>,
    pub desired_limit_w: Option<u16>,
    pub override_detected: bool,
    pub write_performed: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceReport {
    fn initial(device: &str, policy: &PolicyState) -> Self {
        Self {
            device: device.to_string(),
            automation_enabled: policy.automation_enabled,
            manual_limit_w: policy.manual_limit_w,
            ..Self::default()
        }
    }

    fn apply_price(&mut self, price: &PriceView) {
        self.current_price = price.latest.map(|s| s.value);
        self.price_curtail = price.curtail();
    }
}

/// The process-side ends of one device's channels.
pub struct DeviceHandle {
    pub name: String,
    pub policy: watch::Sender<PolicyState>,
    pub prices: mpsc::Sender<PriceEvent>,
    pub reports: watch::Receiver<DeviceReport>,
}

impl DeviceHandle {
    /// Queue a price sample for the gate. A full queue drops the sample; the
    /// feed will publish again.
    pub fn offer_price(&self, sample: PriceSample) {
        self.offer(PriceEvent::Sample(sample));
    }

    /// Tell the gate the source has no price right now.
    pub fn price_unavailable(&self) {
        self.offer(PriceEvent::Unavailable);
    }

    fn offer(&self, event: PriceEvent) {
        if let Err(e) = self.prices.try_send(event) {
            warn!(device = %self.name, error = %e, "price event dropped");
        }
    }
}

pub struct DeviceRuntime<L> {
    name: String,
    reconciler: LimitReconciler<L>,
    poll_interval: Duration,
    io_timeout: Duration,
    policy: watch::Receiver<PolicyState>,
    price: watch::Receiver<PriceView>,
    report: watch::Sender<DeviceReport>,
}

/// Start the price gate and poll loop for one device on `tasks`.
pub fn spawn_device<L>(
    cfg: &DeviceConfig,
    link: L,
    cancel: CancellationToken,
    tasks: &mut JoinSet<()>,
) -> DeviceHandle
where
    L: RegisterLink + 'static,
{
    let policy = PolicyState::new(
        cfg.automation_enabled,
        cfg.price_threshold,
        cfg.curtailed_limit,
    );
    let (policy_tx, policy_rx) = watch::channel(policy.clone());
    let (price_tx, price_rx) = mpsc::channel(PRICE_QUEUE);
    let (view_tx, view_rx) = watch::channel(PriceView::default());
    let (report_tx, report_rx) = watch::channel(DeviceReport::initial(&cfg.name, &policy));

    let span = info_span!("device", device = %cfg.name);

    let gate = PriceGate::new(cfg.price_threshold, PRICE_DEBOUNCE, MonotonicClock::new());
    tasks.spawn(run_price_gate(gate, price_rx, view_tx, cancel.clone()).instrument(span.clone()));

    let runtime = DeviceRuntime {
        name: cfg.name.clone(),
        reconciler: LimitReconciler::new(link, cfg.registers, cfg.failure_threshold),
        poll_interval: cfg.poll_interval(),
        io_timeout: cfg.retry_policy().timeout,
        policy: policy_rx,
        price: view_rx,
        report: report_tx,
    };
    tasks.spawn(runtime.run(cancel).instrument(span));

    DeviceHandle {
        name: cfg.name.clone(),
        policy: policy_tx,
        prices: price_tx,
        reports: report_rx,
    }
}

impl<L: RegisterLink> DeviceRuntime<L> {
    pub async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = self.reconciler.link_mut().connect() => match res {
                Ok(()) => info!("startup probe succeeded"),
                Err(e) => warn!(error = %e, "startup probe failed; retrying on every poll"),
            },
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut price_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = self.policy.changed() => {
                    if changed.is_err() {
                        debug!("policy owner gone");
                        break;
                    }
                    debug!("policy changed; reconciling now");
                }
                changed = self.price.changed(), if price_open => {
                    match changed {
                        Ok(()) => {
                            let view = *self.price.borrow_and_update();
                            self.report.send_modify(|r| r.apply_price(&view));
                        }
                        Err(_) => price_open = false,
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("in-flight cycle abandoned on shutdown");
                    break;
                }
                _ = self.cycle() => {}
            }
        }

        if tokio::time::timeout(self.io_timeout, self.reconciler.link_mut().disconnect())
            .await
            .is_err()
        {
            warn!("disconnect did not finish in time");
        }
        self.report.send_modify(|r| r.available = false);
        debug!("device runtime stopped");
    }

    async fn cycle(&mut self) {
        let policy = self.policy.borrow_and_update().clone();
        let price = *self.price.borrow();
        let result = self.reconciler.tick(&policy, price.curtail()).await;
        let report = self.build_report(&policy, &price, &result);
        self.report.send_replace(report);
    }

    fn build_report(
        &self,
        policy: &PolicyState,
        price: &PriceView,
        result: &Result<ReconcileOutcome, CycleError>,
    ) -> DeviceReport {
        let state = self.reconciler.device_state();
        let outcome = result.as_ref().ok();
        let mut report = DeviceReport {
            device: self.name.clone(),
            available: !self.reconciler.is_degraded(),
            export_limit_w: state.map(|s| s.active_limit_w),
            grid_max_w: state.map(|s| s.grid_max_w),
            curtailed: state.map(|s| s.curtailed()),
            automation_enabled: policy.automation_enabled,
            manual_limit_w: policy.manual_limit_w,
            desired_limit_w: outcome.map(|o| o.desired_limit_w),
            override_detected: outcome.is_some_and(|o| o.override_detected),
            write_performed: outcome.is_some_and(|o| o.write_performed),
            consecutive_failures: self.reconciler.consecutive_failures(),
            last_error: result.as_ref().err().map(|e| e.to_string()),
            updated_at: Some(Utc::now()),
            ..DeviceReport::default()
        };
        report.apply_price(price);
        report
    }
}

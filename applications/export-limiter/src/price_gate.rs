//! Debounced curtail decision from a noisy price feed.
//!
//! A sample whose classification (price at or below the threshold, or above)
//! differs from the stable one opens a pending transition. The transition
//! commits once the debounce window passes without a sample reverting it; a
//! reverting sample cancels it and the stable state stays as it was.

use crate::clock::{Clock, MonotonicClock};
use crate::price::PriceSample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const PRICE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Whether to curtail now, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CurtailDecision {
    pub curtail: bool,
    pub effective_since: DateTime<Utc>,
}

/// What the rest of the device sees of the price feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriceView {
    pub latest: Option<PriceSample>,
    pub decision: Option<CurtailDecision>,
}

/// What the feed delivers to a device's gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceEvent {
    Sample(PriceSample),
    /// The source reported no price. The last decision stands.
    Unavailable,
}

impl PriceView {
    /// No committed decision yet counts as "don't curtail".
    pub fn curtail(&self) -> bool {
        self.decision.map(|d| d.curtail).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateState {
    /// No sample has committed yet.
    Unsettled,
    Stable {
        curtail: bool,
        value: f64,
    },
    Pending {
        /// Classification and price the gate returns to if the candidate is reverted.
        stable: Option<(bool, f64)>,
        curtail: bool,
        candidate: f64,
        since: DateTime<Utc>,
    },
}

pub struct PriceGate<C = MonotonicClock> {
    threshold: f64,
    window: chrono::Duration,
    clock: C,
    state: GateState,
    latest: Option<PriceSample>,
    decision: Option<CurtailDecision>,
}

impl<C: Clock> PriceGate<C> {
    pub fn new(threshold: f64, window: Duration, clock: C) -> Self {
        Self {
            threshold,
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            clock,
            state: GateState::Unsettled,
            latest: None,
            decision: None,
        }
    }

    pub fn classify(&self, value: f64) -> bool {
        value <= self.threshold
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn decision(&self) -> Option<CurtailDecision> {
        self.decision
    }

    pub fn latest(&self) -> Option<PriceSample> {
        self.latest
    }

    pub fn view(&self) -> PriceView {
        PriceView {
            latest: self.latest,
            decision: self.decision,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// When the pending transition commits, if one is pending.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            GateState::Pending { since, .. } => Some(since + self.window),
            _ => None,
        }
    }

    /// Feed one sample. Returns a decision only when an overdue pending
    /// transition had to be committed before the sample could be applied.
    pub fn observe(&mut self, sample: PriceSample) -> Option<CurtailDecision> {
        let committed = self.poll();
        self.latest = Some(sample);

        let curtail = self.classify(sample.value);
        let now = self.clock.now();

        self.state = match self.state {
            GateState::Stable { curtail: stable, .. } if stable == curtail => GateState::Stable {
                curtail: stable,
                value: sample.value,
            },
            GateState::Stable {
                curtail: stable,
                value,
            } => {
                debug!(price = sample.value, curtail, "price crossed threshold; debouncing");
                GateState::Pending {
                    stable: Some((stable, value)),
                    curtail,
                    candidate: sample.value,
                    since: now,
                }
            }
            GateState::Unsettled => GateState::Pending {
                stable: None,
                curtail,
                candidate: sample.value,
                since: now,
            },
            GateState::Pending {
                stable,
                curtail: pending,
                candidate,
                since,
            } if pending == curtail => GateState::Pending {
                stable,
                curtail: pending,
                candidate: sample.value,
                // a moved candidate waits out a full window of its own
                since: if sample.value != candidate { now } else { since },
            },
            GateState::Pending {
                stable: Some((stable, value)),
                ..
            } if stable == curtail => {
                debug!(price = sample.value, "price reverted within debounce window");
                GateState::Stable {
                    curtail: stable,
                    value,
                }
            }
            GateState::Pending { stable, .. } => GateState::Pending {
                stable,
                curtail,
                candidate: sample.value,
                since: now,
            },
        };

        committed
    }

    /// Forget the last sample without touching the decision or a pending
    /// transition.
    pub fn clear_latest(&mut self) {
        if self.latest.take().is_some() {
            debug!("price unavailable; cleared latest sample");
        }
    }

    /// Commit the pending transition if its window has elapsed.
    pub fn poll(&mut self) -> Option<CurtailDecision> {
        let GateState::Pending {
            curtail,
            candidate,
            since,
            ..
        } = self.state
        else {
            return None;
        };

        let deadline = since + self.window;
        if self.clock.now() < deadline {
            return None;
        }

        let decision = CurtailDecision {
            curtail,
            effective_since: deadline,
        };
        info!(price = candidate, curtail, "curtail decision committed");
        self.state = GateState::Stable {
            curtail,
            value: candidate,
        };
        self.decision = Some(decision);
        Some(decision)
    }
}

/// Drive a gate from an event channel, publishing every change to `view`.
///
/// Only updates the view; field-bus I/O stays with the poll loop.
pub async fn run_price_gate<C: Clock>(
    mut gate: PriceGate<C>,
    mut events: mpsc::Receiver<PriceEvent>,
    view: watch::Sender<PriceView>,
    cancel: CancellationToken,
) {
    loop {
        let wait = gate
            .deadline()
            .map(|d| (d - gate.now()).to_std().unwrap_or(Duration::ZERO));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait.unwrap_or(Duration::ZERO)), if wait.is_some() => {
                gate.poll();
            }
            event = events.recv() => match event {
                Some(PriceEvent::Sample(sample)) => {
                    gate.observe(sample);
                }
                Some(PriceEvent::Unavailable) => gate.clear_latest(),
                None => break,
            },
        }

        let next = gate.view();
        view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
    debug!("price gate stopped");
}

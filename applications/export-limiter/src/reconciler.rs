//! One device's reconciliation loop body.
//!
//! Each `tick` reads the active export limit and the grid maximum, flags an
//! override when the device no longer holds what was last intended, and writes
//! the desired limit back if the two differ. Device state only ever reflects
//! a successful read or an acknowledged write.

use crate::clock::{Clock, SystemClock};
use crate::config::RegisterConfig;
use crate::error::{CycleError, LinkError};
use crate::link::RegisterLink;
use crate::policy::{desired_limit, PolicyState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Reading,
    Computing,
    Writing,
}

/// Last observed device truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceLimitState {
    pub active_limit_w: u16,
    pub grid_max_w: u16,
    pub last_read_at: DateTime<Utc>,
    pub last_write_at: Option<DateTime<Utc>>,
}

impl DeviceLimitState {
    /// The device is held below what the grid allows.
    pub fn curtailed(&self) -> bool {
        self.active_limit_w < self.grid_max_w
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub desired_limit_w: u16,
    pub override_detected: bool,
    pub write_performed: bool,
}

pub struct LimitReconciler<L, C = SystemClock> {
    link: L,
    registers: RegisterConfig,
    clock: C,
    phase: Phase,
    device_state: Option<DeviceLimitState>,
    last_intended: Option<u16>,
    consecutive_failures: u32,
    failure_threshold: u32,
}

impl<L: RegisterLink> LimitReconciler<L> {
    pub fn new(link: L, registers: RegisterConfig, failure_threshold: u32) -> Self {
        Self::with_clock(link, registers, failure_threshold, SystemClock)
    }
}

impl<L: RegisterLink, C: Clock> LimitReconciler<L, C> {
    pub fn with_clock(link: L, registers: RegisterConfig, failure_threshold: u32, clock: C) -> Self {
        Self {
            link,
            registers,
            clock,
            phase: Phase::Idle,
            device_state: None,
            last_intended: None,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn device_state(&self) -> Option<DeviceLimitState> {
        self.device_state
    }

    pub fn last_intended(&self) -> Option<u16> {
        self.last_intended
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Enough cycles in a row have failed that the link counts as down.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Run exactly one cycle against the given policy snapshot and curtail decision.
    pub async fn tick(
        &mut self,
        policy: &PolicyState,
        curtail: bool,
    ) -> Result<ReconcileOutcome, CycleError> {
        let result = self.cycle(policy, curtail).await;
        self.phase = Phase::Idle;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    async fn cycle(
        &mut self,
        policy: &PolicyState,
        curtail: bool,
    ) -> Result<ReconcileOutcome, CycleError> {
        self.phase = Phase::Reading;
        let active = self.read(self.registers.export_limit).await?;
        let grid_max = self.read(self.registers.grid_max).await?;
        self.device_state = Some(DeviceLimitState {
            active_limit_w: active,
            grid_max_w: grid_max,
            last_read_at: self.clock.now(),
            last_write_at: self.device_state.and_then(|s| s.last_write_at),
        });

        self.phase = Phase::Computing;
        let override_detected = match self.last_intended {
            Some(intended) if intended != active => {
                info!(
                    intended,
                    active,
                    grid_max,
                    "export limit changed outside this service"
                );
                true
            }
            _ => false,
        };

        let desired = desired_limit(policy, curtail, grid_max);
        if active == desired {
            debug!(limit = active, grid_max, "export limit already at desired value");
            self.last_intended = Some(desired);
            return Ok(ReconcileOutcome {
                desired_limit_w: desired,
                override_detected,
                write_performed: false,
            });
        }

        self.phase = Phase::Writing;
        self.link
            .write_register(self.registers.export_limit, desired)
            .await
            .map_err(|source| CycleError::Write {
                value: desired,
                source,
            })?;

        let written_at = self.clock.now();
        if let Some(state) = self.device_state.as_mut() {
            state.active_limit_w = desired;
            state.last_write_at = Some(written_at);
        }
        self.last_intended = Some(desired);
        info!(from = active, to = desired, grid_max, curtail, "export limit written");

        Ok(ReconcileOutcome {
            desired_limit_w: desired,
            override_detected,
            write_performed: true,
        })
    }

    async fn read(&mut self, register: u16) -> Result<u16, CycleError> {
        self.link
            .read_register(register)
            .await
            .map_err(|source: LinkError| CycleError::Read { register, source })
    }

    fn record_success(&mut self) {
        if self.is_degraded() {
            info!(
                after_failures = self.consecutive_failures,
                "device link recovered"
            );
        }
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, err: &CycleError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == self.failure_threshold {
            error!(
                failures = self.consecutive_failures,
                kind = err.link_error().kind(),
                error = %err,
                "device link degraded"
            );
        } else {
            warn!(
                failures = self.consecutive_failures,
                kind = err.link_error().kind(),
                error = %err,
                "reconcile cycle failed"
            );
        }
    }
}

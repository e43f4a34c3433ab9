use serde::{Deserialize, Serialize};

/// Upper bound for the user-set manual limit (W).
pub const MANUAL_LIMIT_MAX: u16 = 15_000;

/// User-controlled policy for one device.
///
/// Changed between cycles by commands from the host surface; the reconciler
/// takes one snapshot per cycle and never writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub automation_enabled: bool,
    pub price_threshold: f64,
    pub curtailed_limit_w: u16,
    pub manual_limit_w: Option<u16>,
}

impl PolicyState {
    pub fn new(automation_enabled: bool, price_threshold: f64, curtailed_limit_w: u16) -> Self {
        Self {
            automation_enabled,
            price_threshold,
            curtailed_limit_w,
            manual_limit_w: None,
        }
    }
}

/// Limit the device should hold, never above `grid_max_w`.
///
/// Automation on and curtailing: the curtailed limit. Automation off with a
/// manual limit below the grid maximum: the manual limit. Otherwise the grid
/// maximum.
pub fn desired_limit(policy: &PolicyState, curtail: bool, grid_max_w: u16) -> u16 {
    let target = if policy.automation_enabled {
        if curtail {
            policy.curtailed_limit_w
        } else {
            grid_max_w
        }
    } else {
        match policy.manual_limit_w {
            Some(manual) if manual < grid_max_w => manual,
            _ => grid_max_w,
        }
    };
    target.min(grid_max_w)
}

/// Validate a manual limit coming from the host surface.
pub fn check_manual_limit(watts: u16) -> Result<u16, String> {
    if watts > MANUAL_LIMIT_MAX {
        return Err(format!(
            "manual limit {watts} W out of range 0..={MANUAL_LIMIT_MAX}"
        ));
    }
    Ok(watts)
}

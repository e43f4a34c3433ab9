//! Host entity surface over MQTT: retained device state, availability and
//! the two user commands (automation switch, manual limit).

use crate::config::PriceSourceConfig;
use crate::device::{DeviceHandle, DeviceReport};
use crate::error::{AppError, PriceError};
use crate::mqtt::{self, AsyncClient};
use crate::policy::{check_manual_limit, PolicyState};
use crate::price::parse_price_sample;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub state: String,
    pub availability: String,
    pub automation_set: String,
    pub manual_limit_set: String,
}

impl DeviceTopics {
    pub fn new(base_topic: &str, device: &str) -> Self {
        let prefix = format!("{}/{}", base_topic.trim_end_matches('/'), device);
        Self {
            state: format!("{prefix}/state"),
            availability: format!("{prefix}/availability"),
            automation_set: format!("{prefix}/automation/set"),
            manual_limit_set: format!("{prefix}/manual_limit/set"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Automation(bool),
    ManualLimit(Option<u16>),
}

pub fn parse_automation(payload: &[u8]) -> Result<bool, String> {
    let text = String::from_utf8_lossy(payload);
    match text.trim().to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        other => Err(format!("expected ON or OFF, got {other:?}")),
    }
}

/// Integer watts (a float with no fraction is accepted), or `none`/empty to clear.
pub fn parse_manual_limit(payload: &[u8]) -> Result<Option<u16>, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let watts: f64 = text
        .parse()
        .map_err(|_| format!("manual limit {text:?} is not a number"))?;
    if !watts.is_finite() || watts < 0.0 || watts.fract() != 0.0 || watts > f64::from(u16::MAX) {
        return Err(format!("manual limit {text:?} is not a whole number of watts"));
    }
    check_manual_limit(watts as u16).map(Some)
}

/// Apply a command to the policy; true if it changed anything.
pub fn apply_command(policy: &watch::Sender<PolicyState>, command: Command) -> bool {
    policy.send_if_modified(|p| match command {
        Command::Automation(on) if p.automation_enabled != on => {
            p.automation_enabled = on;
            true
        }
        Command::ManualLimit(limit) if p.manual_limit_w != limit => {
            p.manual_limit_w = limit;
            true
        }
        _ => false,
    })
}

struct Entry {
    handle: DeviceHandle,
    topics: DeviceTopics,
    price: PriceSourceConfig,
}

/// Routes incoming publishes to the devices they concern.
pub struct Router {
    entries: Vec<Entry>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, handle: DeviceHandle, topics: DeviceTopics, price: PriceSourceConfig) {
        self.entries.push(Entry {
            handle,
            topics,
            price,
        });
    }

    /// Every filter to subscribe to, without duplicates.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for e in &self.entries {
            for f in [
                &e.price.topic,
                &e.topics.automation_set,
                &e.topics.manual_limit_set,
            ] {
                if !filters.contains(f) {
                    filters.push(f.clone());
                }
            }
        }
        filters
    }

    /// Hand one publish to every device it concerns. Returns how many did.
    pub fn route(&self, topic: &str, payload: &[u8], now: DateTime<Utc>) -> usize {
        let mut delivered = 0;
        for e in &self.entries {
            let name = &e.handle.name;
            if topic == e.topics.automation_set || topic == e.topics.manual_limit_set {
                delivered += 1;
                let parsed = if topic == e.topics.automation_set {
                    parse_automation(payload).map(Command::Automation)
                } else {
                    parse_manual_limit(payload).map(Command::ManualLimit)
                };
                match parsed {
                    Ok(cmd) => {
                        if apply_command(&e.handle.policy, cmd) {
                            info!(device = %name, ?cmd, "policy updated");
                        }
                    }
                    Err(reason) => warn!(device = %name, %topic, %reason, "command rejected"),
                }
            } else if mqtt::topic_matches(&e.price.topic, topic) {
                delivered += 1;
                match parse_price_sample(&e.price, payload, now) {
                    Ok(sample) => e.handle.offer_price(sample),
                    Err(PriceError::Unavailable) => {
                        debug!(device = %name, %topic, "price unavailable; keeping last decision");
                        e.handle.price_unavailable();
                    }
                    Err(err) => warn!(device = %name, %topic, error = %err, "bad price payload"),
                }
            }
        }
        delivered
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// One message for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Messages for a new report. Availability is only sent when it changed.
pub fn report_messages(
    topics: &DeviceTopics,
    report: &DeviceReport,
    last_available: Option<bool>,
) -> Result<Vec<Outgoing>, AppError> {
    let mut out = vec![Outgoing {
        topic: topics.state.clone(),
        payload: serde_json::to_vec(report)?,
        retain: true,
    }];
    if last_available != Some(report.available) {
        out.push(availability(topics, report.available));
    }
    Ok(out)
}

fn availability(topics: &DeviceTopics, online: bool) -> Outgoing {
    Outgoing {
        topic: topics.availability.clone(),
        payload: (if online { ONLINE } else { OFFLINE }).as_bytes().to_vec(),
        retain: true,
    }
}

/// Publish every report change until cancelled, then mark the device offline.
pub async fn publish_reports(
    client: AsyncClient,
    topics: DeviceTopics,
    mut reports: watch::Receiver<DeviceReport>,
    cancel: CancellationToken,
) {
    let mut last_available = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = reports.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let report = reports.borrow_and_update().clone();
        let messages = match report_messages(&topics, &report, last_available) {
            Ok(m) => m,
            Err(e) => {
                warn!(topic = %topics.state, error = %e, "could not encode device report");
                continue;
            }
        };
        for m in messages {
            if let Err(e) = mqtt::publish(&client, &m.topic, m.payload, m.retain).await {
                warn!(error = %e, "report publish failed");
            }
        }
        last_available = Some(report.available);
    }

    let offline = availability(&topics, false);
    if let Err(e) = mqtt::publish(&client, &offline.topic, offline.payload, offline.retain).await {
        debug!(error = %e, "could not publish offline state");
    }
}

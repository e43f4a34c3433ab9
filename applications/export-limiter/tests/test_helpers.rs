#![allow(dead_code)]

use chrono::{DateTime, Utc};
use export_limiter::config::{DeviceConfig, REG_EXPORT_LIMIT, REG_GRID_MAX};
use export_limiter::{LinkError, RegisterLink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct FakeDevice {
    pub registers: HashMap<u16, u16>,
    pub read_errors: HashMap<u16, LinkError>,
    pub write_error: Option<LinkError>,
    pub connect_error: Option<LinkError>,
    pub delay: Option<Duration>,
    pub reads: Vec<u16>,
    pub writes: Vec<(u16, u16)>,
    pub connects: u32,
    pub disconnects: u32,
}

/// Scripted in-memory inverter. Clones share one device, so a test keeps a
/// handle while the reconciler owns the link.
#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    device: Arc<Mutex<FakeDevice>>,
}

impl FakeLink {
    /// An inverter holding `active` W with a grid maximum of `grid_max` W.
    pub fn inverter(active: u16, grid_max: u16) -> Self {
        let link = Self::default();
        link.set(REG_EXPORT_LIMIT, active);
        link.set(REG_GRID_MAX, grid_max);
        link
    }

    pub fn device(&self) -> MutexGuard<'_, FakeDevice> {
        self.device.lock().unwrap()
    }

    pub fn set(&self, address: u16, value: u16) {
        self.device().registers.insert(address, value);
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.device().registers.get(&address).copied()
    }

    pub fn fail_reads(&self, address: u16, err: Option<LinkError>) {
        let mut d = self.device();
        match err {
            Some(err) => d.read_errors.insert(address, err),
            None => d.read_errors.remove(&address),
        };
    }

    pub fn fail_all_reads(&self, err: Option<LinkError>) {
        self.fail_reads(REG_EXPORT_LIMIT, err.clone());
        self.fail_reads(REG_GRID_MAX, err);
    }

    pub fn fail_writes(&self, err: Option<LinkError>) {
        self.device().write_error = err;
    }

    /// Every request takes this long before it answers.
    pub fn respond_after(&self, delay: Duration) {
        self.device().delay = Some(delay);
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.device().writes.clone()
    }

    pub fn reads(&self) -> Vec<u16> {
        self.device().reads.clone()
    }

    fn delay(&self) -> Option<Duration> {
        self.device().delay
    }
}

impl RegisterLink for FakeLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let mut d = self.device();
        d.connects += 1;
        match &d.connect_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn read_register(&mut self, address: u16) -> Result<u16, LinkError> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut d = self.device();
        d.reads.push(address);
        if let Some(err) = d.read_errors.get(&address) {
            return Err(err.clone());
        }
        d.registers
            .get(&address)
            .copied()
            .ok_or_else(|| LinkError::Protocol(format!("illegal address 0x{address:04X}")))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut d = self.device();
        if let Some(err) = &d.write_error {
            return Err(err.clone());
        }
        d.writes.push((address, value));
        d.registers.insert(address, value);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.device().disconnects += 1;
    }
}

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-10-13T11:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// A device entry as it would appear in the config file.
pub fn device_config(name: &str, automation: bool, curtailed_limit: u16) -> DeviceConfig {
    let yaml = format!(
        r#"
name: "{name}"
host: "127.0.0.1"
price:
  topic: "energy/price"
price_threshold: 0.0
curtailed_limit: {curtailed_limit}
poll_interval_secs: 60
automation_enabled: {automation}
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

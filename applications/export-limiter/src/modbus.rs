use crate::config::DeviceConfig;
use crate::error::LinkError;
use crate::link::RegisterLink;
use crate::retry::{retry, RetryPolicy};
use std::net::SocketAddr;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{debug, info};

/// Modbus TCP link to one inverter.
///
/// The connection is reused between requests. A request that does not finish
/// cleanly (transport error, timeout, cancellation) takes the connection down
/// with it, and the next attempt dials again.
pub struct ModbusLink {
    host: String,
    port: u16,
    slave: Slave,
    policy: RetryPolicy,
    ctx: Option<Context>,
}

impl ModbusLink {
    pub fn new(host: impl Into<String>, port: u16, slave: u8, policy: RetryPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            slave: Slave(slave),
            policy,
            ctx: None,
        }
    }

    pub fn from_config(cfg: &DeviceConfig) -> Self {
        Self::new(cfg.host.clone(), cfg.port, cfg.slave, cfg.retry_policy())
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn checkout(&mut self) -> Result<Context, LinkError> {
        match self.ctx.take() {
            Some(ctx) => Ok(ctx),
            None => open(&self.host, self.port, self.slave).await,
        }
    }

    async fn read_once(&mut self, address: u16) -> Result<u16, LinkError> {
        let mut ctx = self.checkout().await?;
        match ctx.read_holding_registers(address, 1).await {
            Ok(Ok(words)) => {
                self.ctx = Some(ctx);
                match words.as_slice() {
                    [value] => Ok(*value),
                    other => Err(LinkError::Protocol(format!(
                        "expected 1 register at 0x{address:04X}, got {}",
                        other.len()
                    ))),
                }
            }
            Ok(Err(exception)) => {
                self.ctx = Some(ctx);
                Err(LinkError::Protocol(format!(
                    "exception reading 0x{address:04X}: {exception}"
                )))
            }
            Err(err) => Err(self.transport_error(err)),
        }
    }

    async fn write_once(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        let mut ctx = self.checkout().await?;
        match ctx.write_single_register(address, value).await {
            Ok(Ok(())) => {
                self.ctx = Some(ctx);
                Ok(())
            }
            Ok(Err(exception)) => {
                self.ctx = Some(ctx);
                Err(LinkError::Rejected(format!(
                    "0x{address:04X} <- {value}: {exception}"
                )))
            }
            Err(err) => Err(self.transport_error(err)),
        }
    }

    fn transport_error(&self, err: tokio_modbus::Error) -> LinkError {
        match err {
            tokio_modbus::Error::Transport(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                LinkError::Timeout(self.policy.timeout)
            }
            tokio_modbus::Error::Transport(io) => LinkError::Connection(io.to_string()),
            other => LinkError::Protocol(other.to_string()),
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| LinkError::Connection(format!("resolving {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| LinkError::Connection(format!("{host}:{port} resolved to no address")))
}

async fn open(host: &str, port: u16, slave: Slave) -> Result<Context, LinkError> {
    let addr = resolve(host, port).await?;
    let ctx = tokio_modbus::client::tcp::connect_slave(addr, slave)
        .await
        .map_err(|e| LinkError::Connection(format!("{addr}: {e}")))?;
    debug!(%addr, slave = slave.0, "modbus connection opened");
    Ok(ctx)
}

impl RegisterLink for ModbusLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let policy = self.policy;
        let ctx = retry(&policy, "connect", &mut *self, |link| {
            Box::pin(open(&link.host, link.port, link.slave))
        })
        .await?;
        info!(
            host = %self.host,
            port = self.port,
            slave = self.slave.0,
            "connected to Modbus device"
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_register(&mut self, address: u16) -> Result<u16, LinkError> {
        let policy = self.policy;
        retry(&policy, "read_register", self, move |link| {
            Box::pin(link.read_once(address))
        })
        .await
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        let policy = self.policy;
        retry(&policy, "write_register", self, move |link| {
            Box::pin(link.write_once(address, value))
        })
        .await
    }

    async fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            info!(host = %self.host, port = self.port, "disconnected from Modbus device");
        }
    }
}

//! Register-level access to one device on the field bus.

use crate::error::LinkError;
use std::future::Future;

/// Single-register read/write against one device.
///
/// Implementations apply their own timeout and bounded retry to every call
/// and report the underlying error once retries are spent. Nothing is cached:
/// a successful read is always a fresh value from the device. Taking
/// `&mut self` keeps at most one request in flight per link.
pub trait RegisterLink: Send {
    fn connect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn read_register(&mut self, address: u16)
        -> impl Future<Output = Result<u16, LinkError>> + Send;

    fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Drop the connection; the next request reconnects.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

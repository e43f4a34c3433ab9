pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod modbus;
pub mod mqtt;
pub mod policy;
pub mod price;
pub mod price_gate;
pub mod reconciler;
pub mod retry;
pub mod surface;

// Re-export commonly used items
pub use config::Config;
pub use error::{AppError, CycleError, LinkError, Result};
pub use link::RegisterLink;

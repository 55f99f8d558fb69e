pub mod config;
pub mod error;
pub mod rpc;
pub mod telemetry;

pub use config::Config;
pub use error::GfsError;

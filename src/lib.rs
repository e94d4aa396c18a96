mod routes;
mod server;

pub mod acquisition;
pub mod app;
pub mod camera;
pub mod channel;
pub mod config;
pub mod detection;
pub mod frame;
pub mod parser;
pub mod protocol;
pub mod sink;
pub mod store;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use acquisition::{AcquisitionLoop, DetectionError};
pub use app::start_app;
pub use detection::DetectionResult;
pub use transport::WsConnector;

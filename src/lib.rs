pub mod api;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod satellite;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{Result, SatelliteError};
pub use satellite::Satellite;

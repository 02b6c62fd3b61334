pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;

pub use config::MeshConfig;
pub use error::{Error, Result};
pub use models::{
    ClientContext, InstanceFilter, RegistryEvent, ServiceInstance, ServiceStatus, Strategy,
};

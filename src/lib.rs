pub mod config;
pub mod registry;

pub use registry::{Registry, RegistryError, RegistryKind, ServiceInfo};

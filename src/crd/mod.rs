//! Custom Resource Definitions for mesh federation
//!
//! The three federation kinds live in the `mm.ibm.istio.io/v1` group. The
//! Istio networking kinds are the downstream objects the styles emit.

pub mod istio;
mod mesh_fed_config;
mod service_binding;
mod service_exposition;
pub mod types;


pub use mesh_fed_config::{Direction, FederationMode, MeshFedConfig, MeshFedConfigSpec};
pub use service_binding::{ServiceBinding, ServiceBindingSpec};
pub use service_exposition::{ServiceExposition, ServiceExpositionSpec, ServiceExpositionStatus};
pub use types::*;

//! mesh-federation: Kubernetes controller federating Istio service meshes
//!
//! Three custom resources drive the controller. A `MeshFedConfig` describes
//! how a mesh federates, a `ServiceExposition` makes a local service
//! reachable from partner meshes and a `ServiceBinding` consumes one. A gRPC
//! discovery bridge lets an exposing mesh announce its services so binding
//! meshes create their ServiceBindings automatically.

pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod store;
pub mod style;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};

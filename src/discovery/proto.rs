//! Discovery wire messages
//!
//! Hand-written prost messages; `build.rs` generates the
//! `mm.federation.v1.ServiceDiscovery` client and server around them.

use std::collections::BTreeMap;

/// Named hello a binder mesh sends to ask for a snapshot
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
}

/// Full list of services a mesh currently exposes
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceList {
    /// Announcing mesh
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub exposed_services: ::prost::alloc::vec::Vec<ExposedService>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExposedService {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(btree_map = "string, string", tag = "3")]
    pub mesh_fed_config_selector: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "4")]
    pub endpoints: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

include!(concat!(env!("OUT_DIR"), "/mm.federation.v1.ServiceDiscovery.rs"));

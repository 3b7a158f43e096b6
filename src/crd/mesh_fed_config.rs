//! MeshFedConfig Custom Resource Definition
//!
//! A MeshFedConfig describes one mesh's federation posture: which style is
//! used, which gateway directions are enabled, where the gateway workloads
//! live and which secret carries the TLS material for cross-mesh hops.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Labels, SpecValidationError, DEFAULT_GATEWAY_PORT};

/// Security/trust posture that decides which networking objects get created
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FederationMode {
    /// Dedicated ingress/egress gateways with mutual TLS on every cross-mesh hop
    #[default]
    Boundary,
    /// Forward through the partner's ingress directly, no per-relationship gateway
    Passthrough,
}

impl std::fmt::Display for FederationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FederationMode::Boundary => write!(f, "BOUNDARY"),
            FederationMode::Passthrough => write!(f, "PASSTHROUGH"),
        }
    }
}

/// Gateway direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Selector applied when the config leaves the gateway selector empty
    pub fn default_selector(&self) -> Labels {
        let value = match self {
            Direction::Ingress => "ingressgateway",
            Direction::Egress => "egressgateway",
        };
        Labels::from([("istio".to_string(), value.to_string())])
    }
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mm.ibm.istio.io",
    version = "v1",
    kind = "MeshFedConfig",
    namespaced,
    derive = "PartialEq",
    shortname = "mfc",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Ingress","type":"boolean","jsonPath":".spec.useIngressGateway"}"#,
    printcolumn = r#"{"name":"Egress","type":"boolean","jsonPath":".spec.useEgressGateway"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshFedConfigSpec {
    #[serde(default)]
    pub mode: FederationMode,

    #[serde(default)]
    pub use_ingress_gateway: bool,

    #[serde(default)]
    pub use_egress_gateway: bool,

    /// Labels of the ingress gateway workload, defaults to `istio: ingressgateway`
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub ingress_gateway_selector: Labels,

    /// Labels of the egress gateway workload, defaults to `istio: egressgateway`
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub egress_gateway_selector: Labels,

    /// 0 means 15443
    #[serde(default)]
    pub ingress_gateway_port: u16,

    /// 0 means 15443
    #[serde(default)]
    pub egress_gateway_port: u16,

    /// Locates exactly one TLS secret; required in BOUNDARY mode
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub tls_context_selector: Labels,
}

impl MeshFedConfigSpec {
    /// Validate the federation posture
    ///
    /// # Errors
    ///
    /// Returns every violation found, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.mode == FederationMode::Boundary && self.tls_context_selector.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.tlsContextSelector",
                "tlsContextSelector is required in BOUNDARY mode",
                "Label the secret holding the gateway certificates and reference it from spec.tlsContextSelector.",
            ));
        }

        if !self.use_ingress_gateway {
            if !self.ingress_gateway_selector.is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.ingressGatewaySelector",
                    "ingressGatewaySelector is set but useIngressGateway is false",
                    "Set spec.useIngressGateway to true or remove spec.ingressGatewaySelector.",
                ));
            }
            if self.ingress_gateway_port != 0 {
                errors.push(SpecValidationError::new(
                    "spec.ingressGatewayPort",
                    "ingressGatewayPort is set but useIngressGateway is false",
                    "Set spec.useIngressGateway to true or remove spec.ingressGatewayPort.",
                ));
            }
        }

        if !self.use_egress_gateway {
            if !self.egress_gateway_selector.is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.egressGatewaySelector",
                    "egressGatewaySelector is set but useEgressGateway is false",
                    "Set spec.useEgressGateway to true or remove spec.egressGatewaySelector.",
                ));
            }
            if self.egress_gateway_port != 0 {
                errors.push(SpecValidationError::new(
                    "spec.egressGatewayPort",
                    "egressGatewayPort is set but useEgressGateway is false",
                    "Set spec.useEgressGateway to true or remove spec.egressGatewayPort.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn uses_gateway(&self, direction: Direction) -> bool {
        match direction {
            Direction::Ingress => self.use_ingress_gateway,
            Direction::Egress => self.use_egress_gateway,
        }
    }

    /// Gateway selector with the default applied
    pub fn gateway_selector(&self, direction: Direction) -> Labels {
        let configured = match direction {
            Direction::Ingress => &self.ingress_gateway_selector,
            Direction::Egress => &self.egress_gateway_selector,
        };
        if configured.is_empty() {
            direction.default_selector()
        } else {
            configured.clone()
        }
    }

    /// Gateway port with the default applied
    pub fn gateway_port(&self, direction: Direction) -> u16 {
        let configured = match direction {
            Direction::Ingress => self.ingress_gateway_port,
            Direction::Egress => self.egress_gateway_port,
        };
        if configured == 0 {
            DEFAULT_GATEWAY_PORT
        } else {
            configured
        }
    }

    /// Fill the empty selector of an enabled direction in place
    pub fn default_gateway_selector(&mut self, direction: Direction) {
        if !self.uses_gateway(direction) {
            return;
        }
        let selector = self.gateway_selector(direction);
        match direction {
            Direction::Ingress => self.ingress_gateway_selector = selector,
            Direction::Egress => self.egress_gateway_selector = selector,
        }
    }
}

//! ServiceBinding Custom Resource Definition
//!
//! Declares that a local namespace wants to consume a service exposed by a
//! partner mesh.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_dns_label, Labels, SpecValidationError};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mm.ibm.istio.io",
    version = "v1",
    kind = "ServiceBinding",
    namespaced,
    derive = "PartialEq",
    shortname = "sb",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Alias","type":"string","jsonPath":".spec.alias"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Name the partner mesh exposes the service under
    pub name: String,

    /// Local name for the facade Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub mesh_fed_config_selector: Labels,

    /// Remote `ip:port` addresses, set by hand or by the discovery bridge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

impl ServiceBindingSpec {
    /// Name local clients call
    pub fn local_name(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if !is_dns_label(&self.name) {
            errors.push(SpecValidationError::new(
                "spec.name",
                format!("{:?} is not a valid DNS label", self.name),
                "Use at most 63 lowercase alphanumerics or '-', starting and ending with an alphanumeric.",
            ));
        }

        if let Some(alias) = self.alias.as_deref().filter(|a| !a.is_empty()) {
            if !is_dns_label(alias) {
                errors.push(SpecValidationError::new(
                    "spec.alias",
                    format!("{:?} is not a valid DNS label", alias),
                    "Use at most 63 lowercase alphanumerics or '-', starting and ending with an alphanumeric.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

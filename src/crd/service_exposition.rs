//! ServiceExposition Custom Resource Definition
//!
//! Declares that a local service should be reachable from partner meshes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Labels;

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mm.ibm.istio.io",
    version = "v1",
    kind = "ServiceExposition",
    namespaced,
    derive = "PartialEq",
    status = "ServiceExpositionStatus",
    shortname = "se",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Alias","type":"string","jsonPath":".spec.alias"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExpositionSpec {
    /// Name of the local Service being exposed
    pub name: String,

    /// Name partner meshes see instead of `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// DestinationRule subset to route to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub mesh_fed_config_selector: Labels,

    /// `ip:port` addresses partners dial, filled in by the controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExpositionStatus {
    #[serde(default)]
    pub ready: bool,
}

impl ServiceExpositionSpec {
    /// Name announced to partners
    pub fn exposed_name(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.name)
    }
}

impl ServiceExposition {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}

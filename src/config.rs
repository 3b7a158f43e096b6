//! Runtime settings
//!
//! `main` parses the command line into [`Settings`]; everything below the
//! composition root only sees this struct.

use std::net::SocketAddr;

use crate::crd::Labels;
use crate::error::{Error, Result};

pub const DEFAULT_PROXY_IMAGE: &str = "docker.io/istio/proxyv2:1.22.3";
pub const DEFAULT_AUTO_EXPOSE_LABEL: &str = "mm.ibm.istio.io/auto-expose";
pub const DEFAULT_EXPOSE_AS_LABEL: &str = "mm.ibm.istio.io/expose-as";
pub const DEFAULT_FED_CONFIG_LABEL: &str = "fed-config";

#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace discovered ServiceBindings are written to
    pub namespace: String,
    /// Name this mesh announces itself with on the discovery stream
    pub mesh_name: String,
    /// Discovery server listen address; the server is disabled when unset
    pub grpc_server_addr: Option<SocketAddr>,
    /// Services carrying this label are treated as discovery peers
    pub discovery_label: Option<(String, String)>,
    pub auto_expose_label: String,
    pub expose_as_label: String,
    /// Label key auto-generated ServiceExpositions select their config by
    pub fed_config_label: String,
    pub default_fed_config: String,
    pub proxy_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            mesh_name: "mesh".to_string(),
            grpc_server_addr: None,
            discovery_label: None,
            auto_expose_label: DEFAULT_AUTO_EXPOSE_LABEL.to_string(),
            expose_as_label: DEFAULT_EXPOSE_AS_LABEL.to_string(),
            fed_config_label: DEFAULT_FED_CONFIG_LABEL.to_string(),
            default_fed_config: "default".to_string(),
            proxy_image: DEFAULT_PROXY_IMAGE.to_string(),
        }
    }
}

impl Settings {
    /// True when `labels` mark a Service as a discovery peer
    pub fn is_discovery_peer(&self, labels: &Labels) -> bool {
        match &self.discovery_label {
            Some((key, value)) => labels.get(key) == Some(value),
            None => false,
        }
    }

    /// Config name and optional alias requested by a Service's labels, or
    /// `None` when the Service is not marked for exposure
    pub fn exposure_request(&self, labels: &Labels) -> Option<(String, Option<String>)> {
        if let Some(value) = labels.get(&self.expose_as_label).filter(|v| !v.is_empty()) {
            return Some(parse_expose_as(value, &self.default_fed_config));
        }
        match labels.get(&self.auto_expose_label).map(String::as_str) {
            Some("true") => Some((self.default_fed_config.clone(), None)),
            _ => None,
        }
    }

    /// Selector auto-generated ServiceExpositions use to find `fed_config`
    pub fn fed_config_selector(&self, fed_config: &str) -> Labels {
        Labels::from([(self.fed_config_label.clone(), fed_config.to_string())])
    }
}

/// Parse a `key:value` label flag
pub fn parse_label(value: &str) -> Result<(String, String)> {
    match value.split_once(':') {
        Some((key, val)) if !key.is_empty() && !val.is_empty() => {
            Ok((key.to_string(), val.to_string()))
        }
        _ => Err(Error::ConfigError(format!(
            "label {:?} must have the form key:value",
            value
        ))),
    }
}

/// Split an expose-as label value of the form `fedConfig.alias` or `alias`
///
/// Aliases are DNS labels, so the last dot separates them from the config name.
pub fn parse_expose_as(value: &str, default_fed_config: &str) -> (String, Option<String>) {
    match value.rsplit_once('.') {
        Some((fed, alias)) => {
            let fed = if fed.is_empty() { default_fed_config } else { fed };
            let alias = Some(alias.to_string()).filter(|a| !a.is_empty());
            (fed.to_string(), alias)
        }
        None => (default_fed_config.to_string(), Some(value.to_string())),
    }
}

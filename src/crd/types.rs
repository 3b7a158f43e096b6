//! Shared types for the federation resource specifications
//!
//! These types are used across the CRD definitions, the style strategies and
//! the reconcilers.

use std::collections::BTreeMap;

/// Label map used for every selector field (`meshFedConfigSelector`,
/// `ingressGatewaySelector`, `tlsContextSelector`, ...)
pub type Labels = BTreeMap<String, String>;

/// API group shared by the three federation kinds
pub const FEDERATION_GROUP: &str = "mm.ibm.istio.io";

/// Port the boundary gateways listen on when the config leaves it at 0
pub const DEFAULT_GATEWAY_PORT: u16 = 15443;

/// Structured validation error for the federation specs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Join a list of validation errors into a single message
pub fn summarize(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// RFC 1123 DNS label: 1-63 lowercase alphanumerics or '-', alphanumeric at both ends
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';
    bytes.iter().all(valid_char)
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// True when `labels` carries every key/value pair of `selector`
pub fn labels_match(labels: Option<&Labels>, selector: &Labels) -> bool {
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|l| l.get(key))
            .map(|v| v == value)
            .unwrap_or(false)
    })
}

/// Render a selector in the `k=v,k2=v2` form the API server expects
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

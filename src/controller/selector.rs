//! MeshFedConfig lookup by label selector

use kube::ResourceExt;
use tracing::warn;

use crate::crd::{
    labels_match, selector_string, Labels, MeshFedConfig, ServiceBinding, ServiceExposition,
};
use crate::error::Result;
use crate::store::ObjectStore;

/// Result of resolving a `meshFedConfigSelector`
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The selector is empty
    NoConfig,
    /// Nothing matches yet
    NotFound,
    Resolved(MeshFedConfig),
    /// More than one config matches; carries `namespace/name` of each
    Ambiguous(Vec<String>),
}

impl Resolution {
    pub fn describe(&self) -> String {
        match self {
            Resolution::NoConfig => "no meshFedConfigSelector set".to_string(),
            Resolution::NotFound => "no MeshFedConfig matches".to_string(),
            Resolution::Resolved(mfc) => format!("resolved to {}", mfc.name_any()),
            Resolution::Ambiguous(names) => {
                format!("ambiguous, matches {}", names.join(", "))
            }
        }
    }
}

/// Kinds that pick their MeshFedConfig by label selector
pub trait SelectsConfig {
    fn mesh_fed_config_selector(&self) -> &Labels;
}

impl SelectsConfig for ServiceExposition {
    fn mesh_fed_config_selector(&self) -> &Labels {
        &self.spec.mesh_fed_config_selector
    }
}

impl SelectsConfig for ServiceBinding {
    fn mesh_fed_config_selector(&self) -> &Labels {
        &self.spec.mesh_fed_config_selector
    }
}

/// Pick the single candidate whose labels satisfy `selector`
pub fn select(candidates: Vec<MeshFedConfig>, selector: &Labels) -> Resolution {
    if selector.is_empty() {
        return Resolution::NoConfig;
    }

    let mut matches: Vec<MeshFedConfig> = candidates
        .into_iter()
        .filter(|mfc| labels_match(mfc.metadata.labels.as_ref(), selector))
        .collect();

    match matches.len() {
        0 => Resolution::NotFound,
        1 => Resolution::Resolved(matches.remove(0)),
        _ => {
            let mut names: Vec<String> = matches
                .iter()
                .map(|m| format!("{}/{}", m.namespace().unwrap_or_default(), m.name_any()))
                .collect();
            names.sort();
            Resolution::Ambiguous(names)
        }
    }
}

/// Resolve `selector` against every MeshFedConfig in the store
pub async fn resolve_mesh_fed_config<S: ObjectStore>(
    store: &S,
    selector: &Labels,
) -> Result<Resolution> {
    if selector.is_empty() {
        return Ok(Resolution::NoConfig);
    }
    let candidates: Vec<MeshFedConfig> = store.list(None, selector).await?;
    let resolution = select(candidates, selector);
    if let Resolution::Ambiguous(names) = &resolution {
        warn!(
            "meshFedConfigSelector {} matches {} configs: {}",
            selector_string(selector),
            names.len(),
            names.join(", ")
        );
    }
    Ok(resolution)
}

/// Objects whose selector `mfc` satisfies
pub fn dependents<'a, K, I>(mfc: &MeshFedConfig, candidates: I) -> Vec<&'a K>
where
    K: SelectsConfig + 'a,
    I: IntoIterator<Item = &'a K>,
{
    candidates
        .into_iter()
        .filter(|obj| {
            let selector = obj.mesh_fed_config_selector();
            !selector.is_empty() && labels_match(mfc.metadata.labels.as_ref(), selector)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MeshFedConfigSpec, ServiceExpositionSpec};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config(name: &str, config_labels: &[(&str, &str)]) -> MeshFedConfig {
        let mut mfc = MeshFedConfig::new(name, MeshFedConfigSpec::default());
        mfc.metadata.namespace = Some("mesh-system".to_string());
        mfc.metadata.labels = Some(labels(config_labels));
        mfc
    }

    fn candidates() -> Vec<MeshFedConfig> {
        vec![
            config("limited-trust", &[("fed-config", "limited-trust")]),
            config("passthrough", &[("fed-config", "passthrough")]),
            config("unlabelled", &[]),
        ]
    }

    #[test]
    fn test_single_match_resolves() {
        let resolution = select(candidates(), &labels(&[("fed-config", "limited-trust")]));
        match resolution {
            Resolution::Resolved(mfc) => assert_eq!(mfc.name_any(), "limited-trust"),
            other => panic!("expected Resolved, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_matches_is_not_found() {
        assert_eq!(
            select(candidates(), &labels(&[("fed-config", "strict")])),
            Resolution::NotFound
        );
    }

    #[test]
    fn test_empty_selector_is_no_config() {
        assert_eq!(select(candidates(), &Labels::new()), Resolution::NoConfig);
    }

    #[test]
    fn test_multiple_matches_are_ambiguous() {
        let mut all = candidates();
        all.push(config(
            "limited-trust-copy",
            &[("fed-config", "limited-trust"), ("team", "b")],
        ));

        let resolution = select(all, &labels(&[("fed-config", "limited-trust")]));
        assert_eq!(
            resolution,
            Resolution::Ambiguous(vec![
                "mesh-system/limited-trust".to_string(),
                "mesh-system/limited-trust-copy".to_string(),
            ])
        );
    }

    #[test]
    fn test_dependents_follow_selectors() {
        let mfc = config("limited-trust", &[("fed-config", "limited-trust")]);
        let exposition = |name: &str, selector: &[(&str, &str)]| {
            ServiceExposition::new(
                name,
                ServiceExpositionSpec {
                    name: name.to_string(),
                    port: 80,
                    mesh_fed_config_selector: labels(selector),
                    ..Default::default()
                },
            )
        };
        let exposures = vec![
            exposition("a", &[("fed-config", "limited-trust")]),
            exposition("b", &[("fed-config", "passthrough")]),
            exposition("c", &[]),
        ];

        let found: Vec<String> = dependents(&mfc, &exposures)
            .into_iter()
            .map(|se| se.name_any())
            .collect();
        assert_eq!(found, vec!["a"]);
    }
}

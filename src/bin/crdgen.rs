//! Print the federation CRDs as a multi-document YAML stream

use kube::CustomResourceExt;
use mesh_federation::crd::{MeshFedConfig, ServiceBinding, ServiceExposition};

fn main() -> anyhow::Result<()> {
    let crds = [
        MeshFedConfig::crd(),
        ServiceExposition::crd(),
        ServiceBinding::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}

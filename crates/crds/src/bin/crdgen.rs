//! Prints the CRD manifests as a multi-document YAML stream.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/bases/crds.yaml
//! ```

use crds::{ServiceBinding, ServiceBindingProjection};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [ServiceBinding::crd(), ServiceBindingProjection::crd()];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}

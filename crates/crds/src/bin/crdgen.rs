//! Prints the CustomResourceDefinition manifests for every RHPAM resource kind.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/rhpam.yaml
//! ```

use crds::{RhpamEnvironment, RhpamIdentity};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [RhpamEnvironment::crd(), RhpamIdentity::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}

use kube::CustomResourceExt;

use gardenlet::resources::managedresources::ManagedResource;
use gardenlet::resources::seeds::Seed;
use gardenlet::resources::shoots::Shoot;

fn main() -> anyhow::Result<()> {
    let crds = [Seed::crd(), Shoot::crd(), ManagedResource::crd()];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}

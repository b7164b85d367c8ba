use kube::CustomResourceExt;
use kyma_lifecycle_operator::crd::{Kyma, ModuleTemplate};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Kyma::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ModuleTemplate::crd())?);
    Ok(())
}

use thiserror::Error;

pub mod v1alpha1;

use kube::CustomResourceExt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_subnet() -> Result<()> {
    print!(
        "---\n{}",
        serde_yaml::to_string(&v1alpha1::subnet::Subnet::crd())?
    );
    Ok(())
}

pub fn crd_gen_ip() -> Result<()> {
    print!("---\n{}", serde_yaml::to_string(&v1alpha1::ip::IP::crd())?);
    Ok(())
}

pub fn crd_gen_vlan() -> Result<()> {
    print!(
        "---\n{}",
        serde_yaml::to_string(&v1alpha1::vlan::Vlan::crd())?
    );
    Ok(())
}

pub fn crd_gen_all() -> Result<()> {
    let crds = vec![
        v1alpha1::subnet::Subnet::crd(),
        v1alpha1::ip::IP::crd(),
        v1alpha1::vlan::Vlan::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

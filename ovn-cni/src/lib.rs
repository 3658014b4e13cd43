use thiserror::Error;

pub mod config;
pub mod controller;
pub mod daemon;
pub mod ipam;
pub mod ovn;
pub mod queue;
pub mod util;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("store error: {0}")]
    Store(#[from] ovn_cni_k8s_utils::Error),

    #[error("crd error: {0}")]
    Crd(#[from] ovn_cni_crds::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("ovn-nbctl: {0}")]
    OvnNb(String),

    #[error("ovs-vsctl: {0}")]
    Ovs(String),

    #[error("link setup failed: {0}")]
    Link(String),

    #[error("{0}")]
    NetworkNotReady(String),
}

/// Not-found on a lookup during reconciliation is success, not retry.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

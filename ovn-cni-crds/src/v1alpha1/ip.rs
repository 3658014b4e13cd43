use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One record per attached pod interface, named `<pod>.<namespace>`.
/// Additional networks append to the parallel attach lists.
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[kube(
    group = "ovn-cni.dev",
    version = "v1alpha1",
    kind = "IP",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    #[serde(default)]
    pub pod_name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub subnet: String,

    #[serde(default)]
    pub attach_subnets: Vec<String>,

    #[serde(default)]
    pub node_name: String,

    #[serde(default)]
    pub ip_address: String,

    #[serde(default)]
    pub attach_ips: Vec<String>,

    #[serde(default)]
    pub mac_address: String,

    #[serde(default)]
    pub attach_macs: Vec<String>,

    #[serde(default, rename = "containerID")]
    pub container_id: String,
}

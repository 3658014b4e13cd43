use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[kube(
    group = "ovn-cni.dev",
    version = "v1alpha1",
    kind = "Vlan",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VlanSpec {
    #[serde(default)]
    pub vlan_id: i32,

    #[serde(default)]
    pub provider_interface_name: String,

    /// Comma-joined names of the subnets bound to this vlan.
    #[serde(default)]
    pub subnet: String,
}

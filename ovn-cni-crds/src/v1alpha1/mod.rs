pub mod ip;
pub mod subnet;
pub mod vlan;

pub use ip::{IP, IPSpec};
pub use subnet::{
    ConditionStatus, ConditionType, GatewayType, Protocol, Subnet, SubnetCondition, SubnetSpec,
    SubnetStatus,
};
pub use vlan::{Vlan, VlanSpec};

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address family of a subnet, derived from its CIDR block.
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Protocol {
    IPv4,
    IPv6,
    Dual,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::IPv4 => write!(f, "IPv4"),
            Protocol::IPv6 => write!(f, "IPv6"),
            Protocol::Dual => write!(f, "Dual"),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    Distributed,
    Centralized,
}

impl fmt::Display for GatewayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayType::Distributed => write!(f, "distributed"),
            GatewayType::Centralized => write!(f, "centralized"),
        }
    }
}

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "ovn-cni.dev",
    version = "v1alpha1",
    kind = "Subnet",
    status = "SubnetStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub vlan: String,

    #[serde(default)]
    pub underlay_gateway: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    #[serde(default)]
    pub namespaces: Vec<String>,

    pub cidr_block: String,

    #[serde(default)]
    pub gateway: String,

    #[serde(default, rename = "excludeIps")]
    pub exclude_ips: Vec<String>,

    #[serde(default)]
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_type: Option<GatewayType>,

    #[serde(default)]
    pub gateway_node: String,

    #[serde(default)]
    pub private: bool,

    #[serde(default)]
    pub allow_subnets: Vec<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SubnetCondition>,

    #[serde(default, rename = "availableIPs")]
    pub available_ips: f64,

    #[serde(default, rename = "usingIPs")]
    pub using_ips: f64,

    #[serde(default)]
    pub activate_gateway: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConditionType {
    Validated,
    Ready,
    Error,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubnetCondition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl SubnetStatus {
    pub fn set_condition(
        &mut self,
        ctype: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        match self.conditions.iter_mut().find(|c| c.r#type == ctype) {
            Some(c) => {
                if c.status != status {
                    c.status = status;
                    c.last_transition_time = Some(now);
                }
                c.reason = reason.to_string();
                c.message = message.to_string();
                c.last_update_time = Some(now);
            }
            None => self.conditions.push(SubnetCondition {
                r#type: ctype,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_update_time: Some(now),
                last_transition_time: Some(now),
            }),
        }
    }

    fn clear_condition(&mut self, ctype: ConditionType) {
        self.conditions.retain(|c| c.r#type != ctype);
    }

    pub fn condition(&self, ctype: ConditionType) -> Option<&SubnetCondition> {
        self.conditions.iter().find(|c| c.r#type == ctype)
    }

    /// Seed Validated/Ready with Unknown so consumers always see the
    /// standard condition set.
    pub fn ensure_standard_conditions(&mut self) {
        for ctype in [ConditionType::Validated, ConditionType::Ready] {
            if self.condition(ctype).is_none() {
                self.set_condition(ctype, ConditionStatus::Unknown, "Init", "");
            }
        }
    }

    pub fn validated(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Validated, ConditionStatus::True, reason, message);
        self.clear_condition(ConditionType::Error);
    }

    pub fn not_validated(&mut self, reason: &str, message: &str) {
        self.set_condition(
            ConditionType::Validated,
            ConditionStatus::False,
            reason,
            message,
        );
    }

    pub fn ready(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Ready, ConditionStatus::True, reason, message);
        self.clear_condition(ConditionType::Error);
    }

    pub fn not_ready(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Ready, ConditionStatus::False, reason, message);
    }

    pub fn set_error(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Error, ConditionStatus::True, reason, message);
    }

    pub fn is_ready(&self) -> bool {
        self.condition(ConditionType::Ready)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_validated(&self) -> bool {
        self.condition(ConditionType::Validated)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Body for a JSON merge patch against the status subresource.
    pub fn merge_patch(&self) -> serde_json::Result<Value> {
        Ok(serde_json::json!({ "status": serde_json::to_value(self)? }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_condition_transitions() {
        let mut status = SubnetStatus::default();
        status.validated("ValidateLogicalSwitchSuccess", "");
        assert!(status.is_validated());

        status.set_error("ValidateLogicalSwitchFailed", "cidr conflict");
        status.not_validated("ValidateLogicalSwitchFailed", "cidr conflict");
        status.not_ready("ValidateLogicalSwitchFailed", "cidr conflict");
        assert!(!status.is_validated());
        assert!(!status.is_ready());
        assert!(status.condition(ConditionType::Error).is_some());

        // recovering clears the error condition again
        status.validated("ValidateLogicalSwitchSuccess", "");
        status.ready("ResetLogicalSwitchAclSuccess", "");
        assert!(status.is_validated());
        assert!(status.is_ready());
        assert!(status.condition(ConditionType::Error).is_none());
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut status = SubnetStatus::default();
        status.ready("ResetLogicalSwitchAclSuccess", "");
        let first = status
            .condition(ConditionType::Ready)
            .and_then(|c| c.last_transition_time)
            .expect("transition time set");
        status.ready("SetPrivateLogicalSwitchSuccess", "");
        let second = status
            .condition(ConditionType::Ready)
            .and_then(|c| c.last_transition_time)
            .expect("transition time kept");
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_patch_field_names() {
        let mut status = SubnetStatus {
            available_ips: 65533.0,
            using_ips: 1.0,
            activate_gateway: "node-b".into(),
            ..Default::default()
        };
        status.ensure_standard_conditions();
        let patch = status.merge_patch().expect("serializable status");
        let status = &patch["status"];
        assert_eq!(status["availableIPs"], 65533.0);
        assert_eq!(status["usingIPs"], 1.0);
        assert_eq!(status["activateGateway"], "node-b");
        assert_eq!(status["conditions"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_spec_serde_names() {
        let spec = SubnetSpec {
            cidr_block: "10.16.0.0/16".into(),
            gateway: "10.16.0.1".into(),
            exclude_ips: vec!["10.16.0.1".into()],
            provider: "ovn".into(),
            protocol: Some(Protocol::IPv4),
            gateway_type: Some(GatewayType::Centralized),
            gateway_node: "a,b".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&spec).expect("serializable spec");
        assert_eq!(v["cidrBlock"], "10.16.0.0/16");
        assert_eq!(v["excludeIps"][0], "10.16.0.1");
        assert_eq!(v["protocol"], "IPv4");
        assert_eq!(v["gatewayType"], "centralized");
        assert_eq!(v["gatewayNode"], "a,b");
    }
}

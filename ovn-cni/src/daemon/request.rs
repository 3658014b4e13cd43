use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniRequest {
    #[serde(default)]
    pub cni_version: String,

    pub pod_name: String,
    pub pod_namespace: String,

    #[serde(default, rename = "containerID")]
    pub container_id: String,

    #[serde(default)]
    pub net_ns: String,

    #[serde(default)]
    pub if_name: String,

    #[serde(default)]
    pub provider: String,

    /// PCI address of an SR-IOV VF; empty for the veth path.
    #[serde(default, rename = "deviceID")]
    pub device_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl CniResponse {
    pub fn error(err: impl Into<String>) -> Self {
        Self {
            err: err.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let req: CniRequest = serde_json::from_str(
            r#"{
                "cniVersion": "0.3.1",
                "podName": "p",
                "podNamespace": "ns",
                "containerID": "abcdef123456",
                "netNs": "/proc/42/ns/net",
                "ifName": "eth0",
                "provider": "ovn",
                "deviceID": ""
            }"#,
        )
        .expect("valid request");
        assert_eq!(req.pod_name, "p");
        assert_eq!(req.container_id, "abcdef123456");
        assert_eq!(req.net_ns, "/proc/42/ns/net");
        assert!(req.device_id.is_empty());
    }

    #[test]
    fn test_response_wire_names() {
        let resp = CniResponse {
            protocol: "IPv4".into(),
            ip_address: "10.16.0.5".into(),
            mac_address: "00:00:00:3e:49:c2".into(),
            cidr: "10.16.0.0/16".into(),
            gateway: "10.16.0.1".into(),
            err: String::new(),
        };
        let v = serde_json::to_value(&resp).expect("serializable response");
        assert_eq!(v["ipAddress"], "10.16.0.5");
        assert_eq!(v["macAddress"], "00:00:00:3e:49:c2");
        assert_eq!(v["cidr"], "10.16.0.0/16");
        assert!(v.get("err").is_none());
    }
}

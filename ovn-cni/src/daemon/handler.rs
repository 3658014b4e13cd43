use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use ovn_cni_crds::v1alpha1::{IP, IPSpec, Protocol};
use tracing::{error, info};

use super::nic;
use super::request::{CniRequest, CniResponse};
use crate::config::DaemonArgs;
use crate::util::{self, OVN_PROVIDER, SUBNET_NAME_LABEL};
use crate::{Error, Result, is_not_found};

const POD_ANNOTATION_RETRIES: u32 = 15;
const POD_ANNOTATION_INTERVAL: Duration = Duration::from_secs(1);

pub struct CniHandler {
    client: Client,
    ips: Api<IP>,
    pub(crate) config: DaemonArgs,
}

/// Network identity the controller published onto the pod.
#[derive(Clone, Debug)]
pub(crate) struct PodNetwork {
    pub mac: String,
    pub ip: String,
    pub cidr: String,
    pub gateway: String,
    pub subnet: String,
    pub ingress: String,
    pub egress: String,
    pub vlan_id: String,
    /// Addresses rejoined with their prefix lengths, one per family.
    pub ip_with_prefix: String,
    pub protocol: Protocol,
}

impl PodNetwork {
    pub(crate) fn from_annotations(
        annotations: &BTreeMap<String, String>,
        provider: &str,
    ) -> Result<Self> {
        let get = |key: String| annotations.get(&key).cloned().unwrap_or_default();
        let ip = get(util::ip_address_annotation(provider));
        let cidr = get(util::cidr_annotation(provider));
        let ip_with_prefix = join_ip_and_prefix(&ip, &cidr)?;
        Ok(Self {
            mac: get(util::mac_address_annotation(provider)),
            gateway: get(util::gateway_annotation(provider)),
            subnet: get(util::logical_switch_annotation(provider)),
            ingress: get(util::INGRESS_RATE_ANNOTATION.to_string()),
            egress: get(util::EGRESS_RATE_ANNOTATION.to_string()),
            vlan_id: get(util::VLAN_ID_ANNOTATION.to_string()),
            protocol: util::check_protocol(&cidr)?,
            ip,
            cidr,
            ip_with_prefix,
        })
    }
}

/// `ip` carries bare addresses, `cidr` the per-family blocks; zip them back
/// into address/prefix pairs.
fn join_ip_and_prefix(ip: &str, cidr: &str) -> Result<String> {
    let ips: Vec<&str> = ip.split(',').map(str::trim).collect();
    let cidrs: Vec<&str> = cidr.split(',').map(str::trim).collect();
    if ips.len() != cidrs.len() {
        return Err(Error::Validation(format!(
            "ip {ip} does not pair with cidr {cidr}"
        )));
    }
    let parts: Vec<String> = ips
        .iter()
        .zip(cidrs.iter())
        .map(|(ip, cidr)| {
            let prefix = cidr.split('/').nth(1).ok_or_else(|| {
                Error::Validation(format!("cidr {cidr} has no prefix length"))
            })?;
            Ok(format!("{ip}/{prefix}"))
        })
        .collect::<Result<_>>()?;
    Ok(parts.join(","))
}

impl CniHandler {
    pub fn new(client: Client, config: DaemonArgs) -> Self {
        Self {
            ips: Api::all(client.clone()),
            client,
            config,
        }
    }

    /// Poll until the controller has published the pod's address, then
    /// extract it.
    async fn wait_pod_network(&self, req: &CniRequest) -> Result<PodNetwork> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &req.pod_namespace);
        let allocated_key = util::allocated_annotation(&req.provider);
        for _ in 0..POD_ANNOTATION_RETRIES {
            let pod = pods.get(&req.pod_name).await.map_err(|e| {
                error!(%e, "get pod {}/{} failed", req.pod_namespace, req.pod_name);
                Error::from(e)
            })?;
            let annotations = pod.annotations();
            if annotations.get(&allocated_key).map(String::as_str) != Some("true") {
                info!("wait address for pod {}/{}", req.pod_namespace, req.pod_name);
                tokio::time::sleep(POD_ANNOTATION_INTERVAL).await;
                continue;
            }
            if let Err(e) = util::validate_pod_network(annotations, &req.provider) {
                error!(%e, "validate pod {}/{} failed", req.pod_namespace, req.pod_name);
                tokio::time::sleep(POD_ANNOTATION_INTERVAL).await;
                continue;
            }
            return PodNetwork::from_annotations(annotations, &req.provider);
        }
        Err(Error::Validation(format!(
            "no address allocated to pod {}/{}, please check the controller logs to find errors",
            req.pod_namespace, req.pod_name
        )))
    }

    async fn create_or_update_ip_cr(&self, req: &CniRequest, net: &PodNetwork) -> Result<()> {
        let name = format!("{}.{}", req.pod_name, req.pod_namespace);
        match self.ips.get(&name).await {
            Err(e) if is_not_found(&e) => {
                let mut labels = BTreeMap::new();
                labels.insert(SUBNET_NAME_LABEL.to_string(), net.subnet.clone());
                labels.insert(net.subnet.clone(), String::new());
                let mut ip = IP::new(
                    &name,
                    IPSpec {
                        pod_name: req.pod_name.clone(),
                        namespace: req.pod_namespace.clone(),
                        subnet: net.subnet.clone(),
                        node_name: self.config.node_name.clone(),
                        ip_address: net.ip.clone(),
                        mac_address: net.mac.clone(),
                        container_id: req.container_id.clone(),
                        ..Default::default()
                    },
                );
                ip.metadata.labels = Some(labels);
                self.ips.create(&PostParams::default(), &ip).await.map_err(|e| {
                    error!(%e, "failed to create ip for {}", net.ip);
                    Error::from(e)
                })?;
            }
            Err(e) => {
                error!(%e, "failed to get ip for {}", net.ip);
                return Err(e.into());
            }
            Ok(mut ip_cr) => {
                ip_cr
                    .metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .insert(net.subnet.clone(), String::new());
                ip_cr.spec.attach_subnets.push(net.subnet.clone());
                ip_cr.spec.attach_ips.push(net.ip.clone());
                ip_cr.spec.attach_macs.push(net.mac.clone());
                self.ips
                    .replace(&name, &PostParams::default(), &ip_cr)
                    .await
                    .map_err(|e| {
                        error!(%e, "failed to update ip for {}", net.ip);
                        Error::from(e)
                    })?;
            }
        }
        Ok(())
    }
}

pub(crate) async fn handle_add(
    State(handler): State<Arc<CniHandler>>,
    payload: Result<Json<CniRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            error!(%e, "parse add request failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(CniResponse::error(format!("parse add request failed: {e}"))),
            )
                .into_response();
        }
    };
    info!(
        "add port request for pod {}/{}",
        req.pod_namespace, req.pod_name
    );

    let net = match handler.wait_pod_network(&req).await {
        Ok(net) => net,
        Err(e) => {
            error!(%e, "pod {}/{} network never became ready", req.pod_namespace, req.pod_name);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CniResponse::error(e.to_string())),
            )
                .into_response();
        }
    };

    if let Err(e) = handler.create_or_update_ip_cr(&req, &net).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CniResponse::error(e.to_string())),
        )
            .into_response();
    }

    if req.provider == OVN_PROVIDER {
        info!(
            "create container mac {}, ip {}, cidr {}, gw {}",
            net.mac, net.ip_with_prefix, net.cidr, net.gateway
        );
        if let Err(e) = nic::configure_nic(&req, &net, handler.config.mtu).await {
            error!(%e, "configure nic failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CniResponse::error(format!("configure nic failed: {e}"))),
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        Json(CniResponse {
            protocol: net.protocol.to_string(),
            ip_address: util::ip_without_mask(&net.ip_with_prefix),
            mac_address: net.mac,
            cidr: net.cidr,
            gateway: net.gateway,
            err: String::new(),
        }),
    )
        .into_response()
}

pub(crate) async fn handle_del(
    State(handler): State<Arc<CniHandler>>,
    payload: Result<Json<CniRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            error!(%e, "parse del request failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(CniResponse::error(format!("parse del request failed: {e}"))),
            )
                .into_response();
        }
    };
    info!(
        "delete port request for pod {}/{}",
        req.pod_namespace, req.pod_name
    );

    if req.provider == OVN_PROVIDER
        && let Err(e) =
            nic::delete_nic(&req.pod_name, &req.pod_namespace, &req.container_id, &req.device_id)
                .await
    {
        error!(%e, "del nic failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CniResponse::error(format!("del nic failed: {e}"))),
        )
            .into_response();
    }

    let name = format!("{}.{}", req.pod_name, req.pod_namespace);
    if let Err(e) = handler.ips.delete(&name, &DeleteParams::default()).await
        && !is_not_found(&e)
    {
        error!(%e, "del ip {} failed", name);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CniResponse::error(format!("del ip {name} failed: {e}"))),
        )
            .into_response();
    }

    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pod_network_from_annotations() {
        let annotations = annotations(&[
            ("ovn.kubernetes.io/ip_address", "10.16.0.5"),
            ("ovn.kubernetes.io/cidr", "10.16.0.0/16"),
            ("ovn.kubernetes.io/gateway", "10.16.0.1"),
            ("ovn.kubernetes.io/mac_address", "00:00:00:3e:49:c2"),
            ("ovn.kubernetes.io/logical_switch", "s1"),
            ("ovn.kubernetes.io/ingress_rate", "3"),
            ("ovn.kubernetes.io/vlan_id", "100"),
        ]);
        let net = PodNetwork::from_annotations(&annotations, "ovn").expect("complete annotations");
        assert_eq!(net.ip_with_prefix, "10.16.0.5/16");
        assert_eq!(net.subnet, "s1");
        assert_eq!(net.protocol, Protocol::IPv4);
        assert_eq!(net.ingress, "3");
        assert_eq!(net.egress, "");
        assert_eq!(net.vlan_id, "100");
    }

    #[test]
    fn test_join_ip_and_prefix_dual_stack() {
        assert_eq!(
            join_ip_and_prefix("10.16.0.5,fd00::5", "10.16.0.0/16,fd00::/64").expect("paired"),
            "10.16.0.5/16,fd00::5/64"
        );
        assert!(join_ip_and_prefix("10.16.0.5", "10.16.0.0/16,fd00::/64").is_err());
        assert!(join_ip_and_prefix("10.16.0.5", "10.16.0.0").is_err());
    }
}

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use ovn_cni_crds::v1alpha1::{Protocol, Subnet};

use crate::{Error, Result};

pub const OVN_PROVIDER: &str = "ovn";
pub const CONTROLLER_FINALIZER: &str = "ovn-cni-controller";
pub const NETWORK_TYPE_VLAN: &str = "vlan";

/// Label every IP object carries for its primary subnet, plus an
/// empty-valued label per subnet it belongs to.
pub const SUBNET_NAME_LABEL: &str = "ovn.kubernetes.io/subnet";

pub const LOGICAL_SWITCH_ANNOTATION: &str = "ovn.kubernetes.io/logical_switch";
pub const INGRESS_RATE_ANNOTATION: &str = "ovn.kubernetes.io/ingress_rate";
pub const EGRESS_RATE_ANNOTATION: &str = "ovn.kubernetes.io/egress_rate";
pub const VLAN_ID_ANNOTATION: &str = "ovn.kubernetes.io/vlan_id";
pub const TUNNEL_IP_ANNOTATION: &str = "ovn.kubernetes.io/tunl_ip";

pub fn allocated_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/allocated")
}

pub fn mac_address_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/mac_address")
}

pub fn ip_address_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/ip_address")
}

pub fn cidr_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/cidr")
}

pub fn gateway_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/gateway")
}

pub fn logical_switch_annotation(provider: &str) -> String {
    format!("{provider}.kubernetes.io/logical_switch")
}

/// Parse a possibly dual-stack CIDR block ("cidr" or "cidr4,cidr6").
pub fn parse_cidrs(cidr_block: &str) -> Result<Vec<IpNetwork>> {
    cidr_block
        .split(',')
        .map(|part| {
            IpNetwork::from_str(part.trim())
                .map_err(|e| Error::Validation(format!("cidr {part} is not a valid cidr block: {e}")))
        })
        .collect()
}

/// Address family of an IP or CIDR string; dual-stack values join both
/// families with a comma.
pub fn check_protocol(addr: &str) -> Result<Protocol> {
    let mut v4 = false;
    let mut v6 = false;
    for part in addr.split(',') {
        let part = part.trim();
        let ip = match IpNetwork::from_str(part) {
            Ok(net) => net.ip(),
            Err(_) => IpAddr::from_str(part)
                .map_err(|e| Error::Validation(format!("{part} is not an address or cidr: {e}")))?,
        };
        match ip {
            IpAddr::V4(_) => v4 = true,
            IpAddr::V6(_) => v6 = true,
        }
    }
    match (v4, v6) {
        (true, true) => Ok(Protocol::Dual),
        (true, false) => Ok(Protocol::IPv4),
        (false, true) => Ok(Protocol::IPv6),
        (false, false) => Err(Error::Validation(format!("{addr} carries no address"))),
    }
}

/// Rewrite a CIDR block to its canonical form (network address, host bits
/// cleared), preserving dual-stack ordering.
pub fn canonical_cidr(cidr_block: &str) -> Result<String> {
    let parts: Vec<String> = parse_cidrs(cidr_block)?
        .iter()
        .map(|net| format!("{}/{}", net.network(), net.prefix()))
        .collect();
    Ok(parts.join(","))
}

fn ip_to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn bits_to_ip(bits: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(std::net::Ipv4Addr::from(bits as u32))
    } else {
        IpAddr::V6(std::net::Ipv6Addr::from(bits))
    }
}

/// First usable host address of each family in the CIDR block.
pub fn first_subnet_ip(cidr_block: &str) -> Result<String> {
    let parts: Vec<String> = parse_cidrs(cidr_block)?
        .iter()
        .map(|net| {
            let base = ip_to_bits(net.network());
            bits_to_ip(base + 1, net.is_ipv4()).to_string()
        })
        .collect();
    Ok(parts.join(","))
}

/// Number of assignable addresses in the CIDR block, excluding the network
/// and broadcast addresses of each family.
pub fn address_count(cidr_block: &str) -> Result<f64> {
    let mut count = 0f64;
    for net in parse_cidrs(cidr_block)? {
        let total_bits: u8 = if net.is_ipv4() { 32 } else { 128 };
        let host_bits = total_bits - net.prefix();
        count += (2f64.powi(host_bits as i32) - 2.0).max(0.0);
    }
    Ok(count)
}

/// Expand exclude-IP entries into discrete addresses. Entries are single
/// addresses or inclusive ranges written `a..b`; malformed entries are
/// passed through untouched (validation rejects them separately).
pub fn expand_exclude_ips(exclude_ips: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for entry in exclude_ips {
        let Some((start, end)) = entry.split_once("..") else {
            out.push(entry.clone());
            continue;
        };
        let (Ok(start), Ok(end)) = (IpAddr::from_str(start.trim()), IpAddr::from_str(end.trim()))
        else {
            out.push(entry.clone());
            continue;
        };
        if start.is_ipv4() != end.is_ipv4() {
            out.push(entry.clone());
            continue;
        }
        let (lo, hi) = (ip_to_bits(start), ip_to_bits(end));
        let mut cur = lo;
        while cur <= hi {
            out.push(bits_to_ip(cur, start.is_ipv4()).to_string());
            cur += 1;
        }
    }
    out
}

/// True when any part of `a` overlaps any part of `b`.
pub fn cidr_conflict(a: &str, b: &str) -> bool {
    let (Ok(a), Ok(b)) = (parse_cidrs(a), parse_cidrs(b)) else {
        return false;
    };
    for x in &a {
        for y in &b {
            if x.is_ipv4() == y.is_ipv4() && (x.contains(y.network()) || y.contains(x.network())) {
                return true;
            }
        }
    }
    false
}

/// True when every part of `ip` lies inside some part of the CIDR block.
pub fn cidr_contains_ip(cidr_block: &str, ip: &str) -> bool {
    let Ok(cidrs) = parse_cidrs(cidr_block) else {
        return false;
    };
    ip.split(',').all(|part| {
        let Ok(addr) = IpAddr::from_str(part.trim()) else {
            return false;
        };
        cidrs.iter().any(|net| net.contains(addr))
    })
}

/// Strip the prefix length from an address or comma-joined address list.
pub fn ip_without_mask(ip: &str) -> String {
    ip.split(',')
        .map(|part| part.split('/').next().unwrap_or(part))
        .collect::<Vec<_>>()
        .join(",")
}

/// Static validation of a Subnet spec: CIDR, gateway membership, exclude-IP
/// ranges, allow-subnets, centralized gateway node list.
pub fn validate_subnet(subnet: &Subnet) -> Result<()> {
    let spec = &subnet.spec;
    parse_cidrs(&spec.cidr_block)?;

    if spec.gateway.is_empty() {
        return Err(Error::Validation(format!(
            "subnet {} has no gateway",
            subnet.metadata.name.as_deref().unwrap_or_default()
        )));
    }
    for gw in spec.gateway.split(',') {
        IpAddr::from_str(gw.trim())
            .map_err(|e| Error::Validation(format!("gateway {gw} is not a valid address: {e}")))?;
    }
    if !cidr_contains_ip(&spec.cidr_block, &spec.gateway) {
        return Err(Error::Validation(format!(
            "gateway {} is not in cidr {}",
            spec.gateway, spec.cidr_block
        )));
    }

    for entry in &spec.exclude_ips {
        match entry.split_once("..") {
            None => {
                IpAddr::from_str(entry.trim()).map_err(|e| {
                    Error::Validation(format!("exclude ip {entry} is not a valid address: {e}"))
                })?;
            }
            Some((start, end)) => {
                let start = IpAddr::from_str(start.trim()).map_err(|e| {
                    Error::Validation(format!("exclude range {entry} start invalid: {e}"))
                })?;
                let end = IpAddr::from_str(end.trim()).map_err(|e| {
                    Error::Validation(format!("exclude range {entry} end invalid: {e}"))
                })?;
                if start.is_ipv4() != end.is_ipv4() {
                    return Err(Error::Validation(format!(
                        "exclude range {entry} mixes address families"
                    )));
                }
                if ip_to_bits(start) > ip_to_bits(end) {
                    return Err(Error::Validation(format!(
                        "exclude range {entry} ends before it starts"
                    )));
                }
            }
        }
    }

    for allow in &spec.allow_subnets {
        IpNetwork::from_str(allow.trim()).map_err(|e| {
            Error::Validation(format!("allow subnet {allow} is not a valid cidr: {e}"))
        })?;
    }

    if spec.gateway_type == Some(ovn_cni_crds::v1alpha1::GatewayType::Centralized)
        && spec.gateway_node.trim().is_empty()
    {
        return Err(Error::Validation(
            "centralized gateway requires a gateway node list".into(),
        ));
    }

    Ok(())
}

/// Validate the pod annotations the controller writes before the CNI server
/// acts on them.
pub fn validate_pod_network(annotations: &BTreeMap<String, String>, provider: &str) -> Result<()> {
    let ip = annotations
        .get(&ip_address_annotation(provider))
        .ok_or_else(|| Error::Validation("pod has no ip_address annotation".into()))?;
    let cidr = annotations
        .get(&cidr_annotation(provider))
        .ok_or_else(|| Error::Validation("pod has no cidr annotation".into()))?;
    let gateway = annotations
        .get(&gateway_annotation(provider))
        .ok_or_else(|| Error::Validation("pod has no gateway annotation".into()))?;
    let mac = annotations
        .get(&mac_address_annotation(provider))
        .ok_or_else(|| Error::Validation("pod has no mac_address annotation".into()))?;
    annotations
        .get(&logical_switch_annotation(provider))
        .ok_or_else(|| Error::Validation("pod has no logical_switch annotation".into()))?;

    parse_cidrs(cidr)?;
    if !cidr_contains_ip(cidr, &ip_without_mask(ip)) {
        return Err(Error::Validation(format!("ip {ip} is not in cidr {cidr}")));
    }
    for gw in gateway.split(',') {
        IpAddr::from_str(gw.trim())
            .map_err(|e| Error::Validation(format!("gateway {gw} is not a valid address: {e}")))?;
    }
    MacAddress::from_str(mac)
        .map_err(|e| Error::Validation(format!("mac {mac} is not a valid address: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_protocol() {
        assert_eq!(check_protocol("10.16.0.0/16").unwrap(), Protocol::IPv4);
        assert_eq!(check_protocol("fd00::/64").unwrap(), Protocol::IPv6);
        assert_eq!(
            check_protocol("10.16.0.0/16,fd00::/64").unwrap(),
            Protocol::Dual
        );
        assert_eq!(check_protocol("10.16.0.5").unwrap(), Protocol::IPv4);
        assert!(check_protocol("not-an-address").is_err());
    }

    #[test]
    fn test_canonical_cidr() {
        assert_eq!(canonical_cidr("10.16.0.1/16").unwrap(), "10.16.0.0/16");
        assert_eq!(canonical_cidr("10.16.0.0/16").unwrap(), "10.16.0.0/16");
        assert_eq!(
            canonical_cidr("10.16.0.1/16,fd00::1/64").unwrap(),
            "10.16.0.0/16,fd00::/64"
        );
        assert!(canonical_cidr("10.16.0.0").is_err());
    }

    #[test]
    fn test_first_subnet_ip() {
        assert_eq!(first_subnet_ip("10.16.0.0/16").unwrap(), "10.16.0.1");
        assert_eq!(
            first_subnet_ip("10.16.0.0/16,fd00::/64").unwrap(),
            "10.16.0.1,fd00::1"
        );
    }

    #[test]
    fn test_address_count() {
        assert_eq!(address_count("10.16.0.0/16").unwrap(), 65534.0);
        assert_eq!(address_count("10.16.0.0/30").unwrap(), 2.0);
        assert_eq!(address_count("10.16.0.0/32").unwrap(), 0.0);
    }

    #[test]
    fn test_expand_exclude_ips() {
        let expanded = expand_exclude_ips(&[
            "10.16.0.1".to_string(),
            "10.16.0.10..10.16.0.12".to_string(),
        ]);
        assert_eq!(
            expanded,
            vec!["10.16.0.1", "10.16.0.10", "10.16.0.11", "10.16.0.12"]
        );
    }

    #[test]
    fn test_cidr_conflict() {
        assert!(cidr_conflict("10.16.0.0/16", "10.16.128.0/17"));
        assert!(!cidr_conflict("10.16.0.0/16", "10.17.0.0/16"));
        // different families never conflict
        assert!(!cidr_conflict("10.16.0.0/16", "fd00::/64"));
    }

    #[test]
    fn test_cidr_contains_ip() {
        assert!(cidr_contains_ip("10.16.0.0/16", "10.16.0.5"));
        assert!(!cidr_contains_ip("10.16.0.0/16", "10.17.0.5"));
        assert!(cidr_contains_ip(
            "10.16.0.0/16,fd00::/64",
            "10.16.0.1,fd00::1"
        ));
        assert!(!cidr_contains_ip("10.16.0.0/16,fd00::/64", "10.16.0.1,fe80::1"));
    }

    #[test]
    fn test_ip_without_mask() {
        assert_eq!(ip_without_mask("10.16.0.5/16"), "10.16.0.5");
        assert_eq!(ip_without_mask("10.16.0.5/16,fd00::5/64"), "10.16.0.5,fd00::5");
        assert_eq!(ip_without_mask("10.16.0.5"), "10.16.0.5");
    }

    #[test]
    fn test_validate_subnet_rejects_foreign_gateway() {
        let mut subnet = Subnet::new(
            "s1",
            ovn_cni_crds::v1alpha1::SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                gateway: "10.17.0.1".into(),
                ..Default::default()
            },
        );
        assert!(validate_subnet(&subnet).is_err());
        subnet.spec.gateway = "10.16.0.1".into();
        assert!(validate_subnet(&subnet).is_ok());
    }

    #[test]
    fn test_validate_subnet_exclude_ranges() {
        let mut subnet = Subnet::new(
            "s1",
            ovn_cni_crds::v1alpha1::SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                gateway: "10.16.0.1".into(),
                exclude_ips: vec!["10.16.0.12..10.16.0.10".into()],
                ..Default::default()
            },
        );
        assert!(validate_subnet(&subnet).is_err());
        subnet.spec.exclude_ips = vec!["10.16.0.10..10.16.0.12".into()];
        assert!(validate_subnet(&subnet).is_ok());
    }

    #[test]
    fn test_validate_pod_network() {
        let mut annotations = BTreeMap::new();
        annotations.insert("ovn.kubernetes.io/ip_address".to_string(), "10.16.0.5".to_string());
        annotations.insert("ovn.kubernetes.io/cidr".to_string(), "10.16.0.0/16".to_string());
        annotations.insert("ovn.kubernetes.io/gateway".to_string(), "10.16.0.1".to_string());
        annotations.insert(
            "ovn.kubernetes.io/mac_address".to_string(),
            "00:00:00:3e:49:c2".to_string(),
        );
        annotations.insert(
            "ovn.kubernetes.io/logical_switch".to_string(),
            "s1".to_string(),
        );
        assert!(validate_pod_network(&annotations, "ovn").is_ok());

        annotations.insert("ovn.kubernetes.io/ip_address".to_string(), "10.17.0.5".to_string());
        assert!(validate_pod_network(&annotations, "ovn").is_err());
    }
}

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use ovn_cni_crds::v1alpha1::Protocol;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutePolicy {
    SrcIp,
    DstIp,
}

impl fmt::Display for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePolicy::SrcIp => write!(f, "src-ip"),
            RoutePolicy::DstIp => write!(f, "dst-ip"),
        }
    }
}

/// Typed surface over the OVN northbound database. The reconciler only
/// talks to OVN through this trait.
#[async_trait]
pub trait OvnNb: Send + Sync {
    async fn logical_switch_exists(&self, ls: &str) -> Result<bool>;

    #[allow(clippy::too_many_arguments)]
    async fn create_logical_switch(
        &self,
        ls: &str,
        protocol: Protocol,
        cidr_block: &str,
        gateway: &str,
        exclude_ips: &[String],
        underlay_gateway: bool,
    ) -> Result<()>;

    async fn set_logical_switch_config(
        &self,
        ls: &str,
        protocol: Protocol,
        cidr_block: &str,
        gateway: &str,
        exclude_ips: &[String],
    ) -> Result<()>;

    async fn delete_logical_switch(&self, ls: &str) -> Result<()>;

    async fn set_private_logical_switch(
        &self,
        ls: &str,
        protocol: Protocol,
        cidr_block: &str,
        allow_subnets: &[String],
    ) -> Result<()>;

    async fn reset_logical_switch_acl(&self, ls: &str, protocol: Protocol) -> Result<()>;

    async fn clean_logical_switch_acl(&self, ls: &str) -> Result<()>;

    async fn add_static_route(
        &self,
        policy: RoutePolicy,
        ip_match: &str,
        next_hop: &str,
        router: &str,
    ) -> Result<()>;

    async fn delete_static_route(&self, ip_match: &str, router: &str) -> Result<()>;

    async fn create_localnet_port(&self, ls: &str, network_name: &str, tag: &str) -> Result<()>;

    async fn delete_localnet_port(&self, ls: &str) -> Result<()>;
}

pub struct OvnNbClient {
    nb_address: String,
    timeout: u32,
    cluster_router: String,
}

impl OvnNbClient {
    pub fn new(nb_address: &str, timeout: u32, cluster_router: &str) -> Self {
        Self {
            nb_address: nb_address.to_string(),
            timeout,
            cluster_router: cluster_router.to_string(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<String> {
        let mut cmd = Command::new("ovn-nbctl");
        cmd.arg(format!("--db={}", self.nb_address))
            .arg(format!("--timeout={}", self.timeout))
            .args(args);
        debug!("ovn-nbctl {}", args.join(" "));
        let output = tokio::time::timeout(Duration::from_secs(self.timeout as u64 + 5), cmd.output())
            .await
            .map_err(|_| Error::OvnNb(format!("{} timed out", args.join(" "))))??;
        if !output.status.success() {
            return Err(Error::OvnNb(format!(
                "{}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// other_config keys for the switch, keyed by family.
    fn switch_config(
        protocol: Protocol,
        cidr_block: &str,
        gateway: &str,
        exclude_ips: &[String],
    ) -> Vec<String> {
        let mut args = Vec::new();
        match protocol {
            Protocol::IPv4 => args.push(format!("other_config:subnet={cidr_block}")),
            Protocol::IPv6 => args.push(format!("other_config:ipv6_prefix={cidr_block}")),
            Protocol::Dual => {
                let mut parts = cidr_block.split(',');
                if let Some(v4) = parts.next() {
                    args.push(format!("other_config:subnet={v4}"));
                }
                if let Some(v6) = parts.next() {
                    args.push(format!("other_config:ipv6_prefix={v6}"));
                }
            }
        }
        args.push(format!("other_config:gateway={gateway}"));
        if !exclude_ips.is_empty() {
            args.push(format!("other_config:exclude_ips={}", exclude_ips.join(" ")));
        }
        args
    }
}

#[async_trait]
impl OvnNb for OvnNbClient {
    async fn logical_switch_exists(&self, ls: &str) -> Result<bool> {
        let out = self
            .exec(&[
                "--data=bare".into(),
                "--no-heading".into(),
                "--columns=name".into(),
                "find".into(),
                "logical_switch".into(),
                format!("name={ls}"),
            ])
            .await?;
        Ok(!out.is_empty())
    }

    async fn create_logical_switch(
        &self,
        ls: &str,
        protocol: Protocol,
        cidr_block: &str,
        gateway: &str,
        exclude_ips: &[String],
        underlay_gateway: bool,
    ) -> Result<()> {
        let mut args = vec!["--may-exist".to_string(), "ls-add".to_string(), ls.to_string()];
        args.push("--".into());
        args.push("set".into());
        args.push("logical_switch".into());
        args.push(ls.to_string());
        args.extend(Self::switch_config(protocol, cidr_block, gateway, exclude_ips));
        self.exec(&args).await?;

        if underlay_gateway {
            // underlay subnets route through the physical network
            return Ok(());
        }

        let router = &self.cluster_router;
        let lrp = format!("{router}-{ls}");
        let lsp = format!("{ls}-{router}");
        let mac = stable_mac(&lrp);
        let mut networks: Vec<String> = Vec::new();
        for (gw, cidr) in gateway.split(',').zip(cidr_block.split(',')) {
            let prefix = cidr.split('/').nth(1).unwrap_or("24");
            networks.push(format!("{gw}/{prefix}"));
        }
        let mut args = vec![
            "--may-exist".to_string(),
            "lrp-add".to_string(),
            router.clone(),
            lrp.clone(),
            mac,
        ];
        args.extend(networks);
        self.exec(&args).await?;

        self.exec(&[
            "--may-exist".into(),
            "lsp-add".into(),
            ls.to_string(),
            lsp.clone(),
            "--".into(),
            "lsp-set-type".into(),
            lsp.clone(),
            "router".into(),
            "--".into(),
            "lsp-set-addresses".into(),
            lsp.clone(),
            "router".into(),
            "--".into(),
            "lsp-set-options".into(),
            lsp,
            format!("router-port={lrp}"),
        ])
        .await?;
        Ok(())
    }

    async fn set_logical_switch_config(
        &self,
        ls: &str,
        protocol: Protocol,
        cidr_block: &str,
        gateway: &str,
        exclude_ips: &[String],
    ) -> Result<()> {
        let mut args = vec!["set".to_string(), "logical_switch".to_string(), ls.to_string()];
        args.extend(Self::switch_config(protocol, cidr_block, gateway, exclude_ips));
        self.exec(&args).await?;
        Ok(())
    }

    async fn delete_logical_switch(&self, ls: &str) -> Result<()> {
        self.exec(&["--if-exists".into(), "ls-del".into(), ls.to_string()])
            .await?;
        Ok(())
    }

    async fn set_private_logical_switch(
        &self,
        ls: &str,
        _protocol: Protocol,
        cidr_block: &str,
        allow_subnets: &[String],
    ) -> Result<()> {
        let mut args = vec!["acl-del".to_string(), ls.to_string()];
        args.extend([
            "--".to_string(),
            "acl-add".to_string(),
            ls.to_string(),
            "to-lport".to_string(),
            "3000".to_string(),
            "ip".to_string(),
            "drop".to_string(),
        ]);
        for cidr in cidr_block.split(',') {
            let family = if cidr.contains(':') { "ip6" } else { "ip4" };
            args.extend([
                "--".to_string(),
                "acl-add".to_string(),
                ls.to_string(),
                "to-lport".to_string(),
                "3001".to_string(),
                format!("{family}.src == {cidr} && {family}.dst == {cidr}"),
                "allow-related".to_string(),
            ]);
            for allow in allow_subnets {
                let allow = allow.trim();
                if (allow.contains(':')) != cidr.contains(':') {
                    continue;
                }
                args.extend([
                    "--".to_string(),
                    "acl-add".to_string(),
                    ls.to_string(),
                    "to-lport".to_string(),
                    "3001".to_string(),
                    format!(
                        "({family}.src == {allow} && {family}.dst == {cidr}) || ({family}.src == {cidr} && {family}.dst == {allow})"
                    ),
                    "allow-related".to_string(),
                ]);
            }
        }
        self.exec(&args).await?;
        Ok(())
    }

    async fn reset_logical_switch_acl(&self, ls: &str, _protocol: Protocol) -> Result<()> {
        self.exec(&["acl-del".into(), ls.to_string()]).await?;
        Ok(())
    }

    async fn clean_logical_switch_acl(&self, ls: &str) -> Result<()> {
        self.exec(&["acl-del".into(), ls.to_string()]).await?;
        Ok(())
    }

    async fn add_static_route(
        &self,
        policy: RoutePolicy,
        ip_match: &str,
        next_hop: &str,
        router: &str,
    ) -> Result<()> {
        self.exec(&[
            "--may-exist".into(),
            format!("--policy={policy}"),
            "lr-route-add".into(),
            router.to_string(),
            ip_match.to_string(),
            next_hop.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn delete_static_route(&self, ip_match: &str, router: &str) -> Result<()> {
        self.exec(&[
            "--if-exists".into(),
            "lr-route-del".into(),
            router.to_string(),
            ip_match.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn create_localnet_port(&self, ls: &str, network_name: &str, tag: &str) -> Result<()> {
        let port = localnet_port_name(ls);
        self.exec(&[
            "--may-exist".into(),
            "lsp-add".into(),
            ls.to_string(),
            port.clone(),
            "--".into(),
            "lsp-set-type".into(),
            port.clone(),
            "localnet".into(),
            "--".into(),
            "lsp-set-addresses".into(),
            port.clone(),
            "unknown".into(),
            "--".into(),
            "lsp-set-options".into(),
            port.clone(),
            format!("network_name={network_name}"),
        ])
        .await?;
        if !tag.is_empty() && tag != "0" {
            self.exec(&[
                "set".into(),
                "logical_switch_port".into(),
                port,
                format!("tag={tag}"),
            ])
            .await?;
        }
        Ok(())
    }

    async fn delete_localnet_port(&self, ls: &str) -> Result<()> {
        self.exec(&[
            "--if-exists".into(),
            "lsp-del".into(),
            localnet_port_name(ls),
        ])
        .await?;
        Ok(())
    }
}

pub fn localnet_port_name(ls: &str) -> String {
    format!("localnet.{ls}")
}

/// Router ports need a MAC; derive one from the port name so repeated
/// reconciles of the same switch program the same address.
fn stable_mac(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let h = hasher.finish();
    format!(
        "00:00:00:{:02x}:{:02x}:{:02x}",
        (h >> 16) as u8,
        (h >> 8) as u8,
        h as u8
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_route_policy_display() {
        assert_eq!(RoutePolicy::SrcIp.to_string(), "src-ip");
        assert_eq!(RoutePolicy::DstIp.to_string(), "dst-ip");
    }

    #[test]
    fn test_stable_mac_is_deterministic() {
        assert_eq!(stable_mac("ovn-cluster-s1"), stable_mac("ovn-cluster-s1"));
        assert_ne!(stable_mac("ovn-cluster-s1"), stable_mac("ovn-cluster-s2"));
        assert!(stable_mac("ovn-cluster-s1").starts_with("00:00:00:"));
    }

    #[test]
    fn test_switch_config_dual_splits_families() {
        let args = OvnNbClient::switch_config(
            Protocol::Dual,
            "10.16.0.0/16,fd00::/64",
            "10.16.0.1,fd00::1",
            &["10.16.0.1".to_string()],
        );
        assert!(args.contains(&"other_config:subnet=10.16.0.0/16".to_string()));
        assert!(args.contains(&"other_config:ipv6_prefix=fd00::/64".to_string()));
        assert!(args.contains(&"other_config:gateway=10.16.0.1,fd00::1".to_string()));
    }
}

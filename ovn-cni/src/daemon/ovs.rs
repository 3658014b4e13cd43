use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

async fn exec(args: &[String]) -> Result<String> {
    let mut cmd = Command::new("ovs-vsctl");
    cmd.args(args);
    debug!("ovs-vsctl {}", args.join(" "));
    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| Error::Ovs(format!("{} timed out", args.join(" "))))??;
    if !output.status.success() {
        return Err(Error::Ovs(format!(
            "{}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Attach the host end of a pod interface to the integration bridge with
/// the identity OVN binds the logical port by.
pub(crate) async fn add_pod_port(
    host_nic: &str,
    iface_id: &str,
    pod_name: &str,
    pod_namespace: &str,
    ip: &str,
) -> Result<()> {
    exec(&[
        "--may-exist".into(),
        "add-port".into(),
        "br-int".into(),
        host_nic.to_string(),
        "--".into(),
        "set".into(),
        "interface".into(),
        host_nic.to_string(),
        format!("external_ids:iface-id={iface_id}"),
        format!("external_ids:pod_name={pod_name}"),
        format!("external_ids:pod_namespace={pod_namespace}"),
        format!("external_ids:ip={ip}"),
    ])
    .await?;
    Ok(())
}

pub(crate) async fn del_pod_port(host_nic: &str) -> Result<()> {
    exec(&[
        "--if-exists".into(),
        "--with-iface".into(),
        "del-port".into(),
        "br-int".into(),
        host_nic.to_string(),
    ])
    .await?;
    Ok(())
}

pub(crate) async fn set_port_tag(port: &str, tag: &str) -> Result<()> {
    exec(&[
        "set".into(),
        "port".into(),
        port.to_string(),
        format!("tag={tag}"),
    ])
    .await?;
    Ok(())
}

/// A crashed pod can leave a stale port carrying the same iface-id; OVN
/// binds the id to only one port, so remove leftovers before adding.
pub(crate) async fn clean_duplicate_port(iface_id: &str, host_nic: &str) -> Result<()> {
    let out = exec(&[
        "--data=bare".into(),
        "--no-heading".into(),
        "--columns=name".into(),
        "find".into(),
        "interface".into(),
        format!("external-ids:iface-id={iface_id}"),
    ])
    .await?;
    for name in out.lines().map(str::trim) {
        if name.is_empty() || name == host_nic {
            continue;
        }
        exec(&[
            "--if-exists".into(),
            "--with-iface".into(),
            "del-port".into(),
            "br-int".into(),
            name.to_string(),
        ])
        .await?;
    }
    Ok(())
}

/// Pod bandwidth annotations are in Mbit/s; OVS polices in Kbit/s and
/// shapes qos in bit/s.
fn rate_to_kbps(rate: &str) -> Result<u64> {
    rate.trim()
        .parse::<u64>()
        .map(|mbps| mbps * 1000)
        .map_err(|e| Error::Validation(format!("bandwidth {rate} is not a number: {e}")))
}

fn rate_to_bps(rate: &str) -> Result<u64> {
    rate.trim()
        .parse::<u64>()
        .map(|mbps| mbps * 1_000_000)
        .map_err(|e| Error::Validation(format!("bandwidth {rate} is not a number: {e}")))
}

/// Pod egress is policed on the OVS ingress side of the interface; pod
/// ingress is shaped by a qos row keyed with the iface-id.
pub(crate) async fn set_interface_bandwidth(
    iface_id: &str,
    ingress: &str,
    egress: &str,
) -> Result<()> {
    let out = exec(&[
        "--data=bare".into(),
        "--no-heading".into(),
        "--columns=name".into(),
        "find".into(),
        "interface".into(),
        format!("external-ids:iface-id={iface_id}"),
    ])
    .await?;
    for name in out.lines().map(str::trim).filter(|n| !n.is_empty()) {
        if !egress.is_empty() {
            let kbps = rate_to_kbps(egress)?;
            exec(&[
                "set".into(),
                "interface".into(),
                name.to_string(),
                format!("ingress_policing_rate={kbps}"),
                format!("ingress_policing_burst={}", kbps / 10),
            ])
            .await?;
        }
        if !ingress.is_empty() {
            let bps = rate_to_bps(ingress)?;
            exec(&[
                "set".into(),
                "port".into(),
                name.to_string(),
                "qos=@q".into(),
                "--".into(),
                "--id=@q".into(),
                "create".into(),
                "qos".into(),
                "type=linux-htb".into(),
                format!("other-config:max-rate={bps}"),
                format!("external-ids:iface-id={iface_id}"),
            ])
            .await?;
        }
    }
    Ok(())
}

pub(crate) async fn clear_pod_bandwidth(pod_name: &str, pod_namespace: &str) -> Result<()> {
    let out = exec(&[
        "--data=bare".into(),
        "--no-heading".into(),
        "--columns=_uuid".into(),
        "find".into(),
        "qos".into(),
        format!("external-ids:iface-id={pod_name}.{pod_namespace}"),
    ])
    .await?;
    for uuid in out.lines().map(str::trim).filter(|u| !u.is_empty()) {
        exec(&["destroy".into(), "qos".into(), uuid.to_string()]).await?;
    }
    Ok(())
}

/// Physical topology for vlan networks: br-provider bridged to br-int by a
/// patch pair, advertised through ovn-bridge-mappings.
pub(crate) async fn ensure_provider_bridge(provider_nic: &str) -> Result<()> {
    exec(&[
        "--may-exist".into(),
        "add-br".into(),
        "br-provider".into(),
        "--".into(),
        "set".into(),
        "open".into(),
        ".".into(),
        format!("external-ids:ovn-bridge-mappings={provider_nic}:br-provider"),
    ])
    .await?;
    exec(&[
        "--may-exist".into(),
        "add-port".into(),
        "br-provider".into(),
        "provider-int".into(),
        "--".into(),
        "set".into(),
        "interface".into(),
        "provider-int".into(),
        "type=patch".into(),
        "options:peer=int-provider".into(),
    ])
    .await?;
    exec(&[
        "--may-exist".into(),
        "add-port".into(),
        "br-int".into(),
        "int-provider".into(),
        "--".into(),
        "set".into(),
        "interface".into(),
        "int-provider".into(),
        "type=patch".into(),
        "options:peer=provider-int".into(),
    ])
    .await?;
    add_provider_nic(provider_nic).await?;
    Ok(())
}

/// A physical nic on an OVS bridge must not carry an address itself.
pub(crate) async fn add_provider_nic(nic: &str) -> Result<()> {
    exec(&[
        "--may-exist".into(),
        "add-port".into(),
        "br-provider".into(),
        nic.to_string(),
    ])
    .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rate_conversions() {
        assert_eq!(rate_to_kbps("3").unwrap(), 3000);
        assert_eq!(rate_to_bps("3").unwrap(), 3_000_000);
        assert!(rate_to_kbps("fast").is_err());
    }
}

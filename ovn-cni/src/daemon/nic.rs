use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::time::Duration;

use ovn_cni_crds::v1alpha1::Protocol;
use tokio::process::Command;
use tracing::{debug, info};

use super::handler::PodNetwork;
use super::ovs;
use super::request::CniRequest;
use crate::{Error, Result, util};

const PING_COUNT: u32 = 600;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const NETNS_DIR: &str = "/var/run/netns";

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

pub(crate) fn generate_nic_name(container_id: &str) -> (String, String) {
    let id = short_id(container_id);
    (format!("{id}_h"), format!("{id}_c"))
}

async fn run(program: &str, args: &[String]) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    debug!("{} {}", program, args.join(" "));
    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| Error::Link(format!("{program} {} timed out", args.join(" "))))??;
    if !output.status.success() {
        return Err(Error::Link(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_in_netns(netns: &str, args: &[String]) -> Result<String> {
    let mut full = vec!["netns".to_string(), "exec".to_string(), netns.to_string()];
    full.extend(args.iter().cloned());
    run("ip", &full).await
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// One end lands on br-int, the other inside the pod. The container end
/// must stay a veth: renaming an OVS internal port makes OVS recreate it,
/// and kubelet insists on seeing eth0 in the pod.
async fn setup_veth_pair(container_id: &str, mtu: u32) -> Result<(String, String)> {
    let (host_nic, container_nic) = generate_nic_name(container_id);
    if let Err(e) = run(
        "ip",
        &args(&[
            "link",
            "add",
            &host_nic,
            "mtu",
            &mtu.to_string(),
            "type",
            "veth",
            "peer",
            "name",
            &container_nic,
        ]),
    )
    .await
    {
        let _ = run("ip", &args(&["link", "del", &host_nic])).await;
        return Err(e);
    }
    Ok((host_nic, container_nic))
}

/// Resolve the VF netdevice and its switchdev representor from the PCI
/// address, rename the representor to the host nic name and hand the VF
/// itself to the pod.
async fn setup_sriov_interface(
    container_id: &str,
    device_id: &str,
    mtu: u32,
) -> Result<(String, String)> {
    let vf_netdevice = single_netdev(&format!("/sys/bus/pci/devices/{device_id}/net"))
        .map_err(|e| Error::Link(format!("failed to get vf netdevice {device_id}: {e}")))?;
    let uplink = first_netdev(&format!("/sys/bus/pci/devices/{device_id}/physfn/net"))
        .map_err(|e| Error::Link(format!("failed to get uplink of {device_id}: {e}")))?;
    let vf_index = vf_index_for(device_id)?;
    let rep = vf_representor(&uplink, vf_index)?;

    let (host_nic, _) = generate_nic_name(container_id);
    rename_link(&rep, &host_nic).await?;
    run("ip", &args(&["link", "set", &host_nic, "mtu", &mtu.to_string()])).await?;
    Ok((host_nic, vf_netdevice))
}

fn single_netdev(dir: &str) -> Result<String> {
    let mut names = netdev_names(dir)?;
    if names.len() != 1 {
        return Err(Error::Link(format!(
            "expected one netdevice in {dir}, found {}",
            names.len()
        )));
    }
    Ok(names.remove(0))
}

fn first_netdev(dir: &str) -> Result<String> {
    netdev_names(dir)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Link(format!("no netdevice in {dir}")))
}

fn netdev_names(dir: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

fn vf_index_for(device_id: &str) -> Result<u32> {
    let physfn = format!("/sys/bus/pci/devices/{device_id}/physfn");
    for entry in fs::read_dir(&physfn)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(idx) = name.strip_prefix("virtfn") else {
            continue;
        };
        let target = fs::read_link(entry.path())?;
        if target.file_name() == Some(OsStr::new(device_id)) {
            return idx
                .parse()
                .map_err(|e| Error::Link(format!("bad vf index {idx}: {e}")));
        }
    }
    Err(Error::Link(format!("no vf index found for {device_id}")))
}

fn vf_representor(uplink: &str, vf_index: u32) -> Result<String> {
    let switch_id = fs::read_to_string(format!("/sys/class/net/{uplink}/phys_switch_id"))
        .map_err(|e| Error::Link(format!("uplink {uplink} has no phys_switch_id: {e}")))?;
    let switch_id = switch_id.trim().to_string();

    for entry in fs::read_dir("/sys/class/net")? {
        let dev = entry?.file_name().to_string_lossy().to_string();
        let Ok(sid) = fs::read_to_string(format!("/sys/class/net/{dev}/phys_switch_id")) else {
            continue;
        };
        if sid.trim() != switch_id {
            continue;
        }
        let Ok(port_name) = fs::read_to_string(format!("/sys/class/net/{dev}/phys_port_name"))
        else {
            continue;
        };
        if representor_port_matches(port_name.trim(), vf_index) {
            return Ok(dev);
        }
    }
    Err(Error::Link(format!(
        "no representor of vf {vf_index} on uplink {uplink}"
    )))
}

fn representor_port_matches(port_name: &str, vf_index: u32) -> bool {
    let suffix = format!("vf{vf_index}");
    port_name == suffix || (port_name.starts_with("pf") && port_name.ends_with(&suffix))
}

async fn rename_link(cur: &str, new: &str) -> Result<()> {
    run("ip", &args(&["link", "set", cur, "down"])).await?;
    run("ip", &args(&["link", "set", cur, "name", new])).await?;
    run("ip", &args(&["link", "set", new, "up"])).await?;
    Ok(())
}

pub(crate) async fn configure_nic(req: &CniRequest, net: &PodNetwork, mtu: u32) -> Result<()> {
    let (host_nic, container_nic) = if req.device_id.is_empty() {
        setup_veth_pair(&req.container_id, mtu).await?
    } else {
        setup_sriov_interface(&req.container_id, &req.device_id, mtu).await?
    };

    let iface_id = format!("{}.{}", req.pod_name, req.pod_namespace);
    let ip_no_mask = util::ip_without_mask(&net.ip_with_prefix);
    ovs::clean_duplicate_port(&iface_id, &host_nic).await?;
    ovs::add_pod_port(&host_nic, &iface_id, &req.pod_name, &req.pod_namespace, &ip_no_mask).await?;

    configure_host_nic(&host_nic, &net.vlan_id).await?;
    ovs::set_interface_bandwidth(&iface_id, &net.ingress, &net.egress).await?;
    configure_container_nic(&container_nic, &req.if_name, net, &req.net_ns, &req.container_id, mtu)
        .await?;
    Ok(())
}

pub(crate) async fn delete_nic(
    pod_name: &str,
    pod_namespace: &str,
    container_id: &str,
    device_id: &str,
) -> Result<()> {
    let (host_nic, _) = generate_nic_name(container_id);
    ovs::del_pod_port(&host_nic).await?;
    ovs::clear_pod_bandwidth(pod_name, pod_namespace).await?;

    if device_id.is_empty() {
        // a link already gone is success
        if let Err(e) = run("ip", &args(&["link", "del", &host_nic])).await
            && !matches!(&e, Error::Link(msg) if msg.contains("Cannot find device"))
        {
            return Err(e);
        }
    }

    // drop the named netns handle if the add path created one
    let _ = run("ip", &args(&["netns", "delete", short_id(container_id)])).await;
    Ok(())
}

async fn configure_host_nic(host_nic: &str, vlan_id: &str) -> Result<()> {
    run("ip", &args(&["link", "set", host_nic, "up", "txqueuelen", "1000"])).await?;
    if !vlan_id.is_empty() && vlan_id != "0" {
        ovs::set_port_tag(host_nic, vlan_id).await?;
    }
    Ok(())
}

async fn configure_container_nic(
    container_nic: &str,
    if_name: &str,
    net: &PodNetwork,
    netns_path: &str,
    container_id: &str,
    mtu: u32,
) -> Result<()> {
    let netns = ensure_named_netns(netns_path, container_id).await?;
    run("ip", &args(&["link", "set", container_nic, "netns", &netns])).await?;
    run_in_netns(&netns, &args(&["ip", "link", "set", container_nic, "down"])).await?;
    run_in_netns(&netns, &args(&["ip", "link", "set", container_nic, "name", if_name])).await?;

    if matches!(net.protocol, Protocol::IPv6 | Protocol::Dual) {
        // sandboxes start with ipv6 disabled; enable it before the v6
        // address and gateway land
        let value =
            run_in_netns(&netns, &args(&["sysctl", "-n", "net.ipv6.conf.all.disable_ipv6"]))
                .await?;
        if value.trim() != "0" {
            run_in_netns(
                &netns,
                &args(&["sysctl", "-w", "net.ipv6.conf.all.disable_ipv6=0"]),
            )
            .await?;
        }
    }

    for addr in net.ip_with_prefix.split(',') {
        run_in_netns(&netns, &args(&["ip", "addr", "replace", addr.trim(), "dev", if_name]))
            .await?;
    }
    run_in_netns(&netns, &args(&["ip", "link", "set", if_name, "address", &net.mac])).await?;
    run_in_netns(&netns, &args(&["ip", "link", "set", if_name, "mtu", &mtu.to_string()])).await?;
    run_in_netns(&netns, &args(&["ip", "link", "set", if_name, "up"])).await?;

    for (family, gw) in default_routes(net.protocol, &net.gateway)? {
        run_in_netns(
            &netns,
            &args(&["ip", family, "route", "replace", "default", "via", &gw, "dev", if_name]),
        )
        .await?;
    }

    wait_network_ready(&netns, &net.gateway).await
}

/// Default routes per family; dual-stack installs v4 first.
fn default_routes(protocol: Protocol, gateway: &str) -> Result<Vec<(&'static str, String)>> {
    match protocol {
        Protocol::IPv4 => Ok(vec![("-4", gateway.to_string())]),
        Protocol::IPv6 => Ok(vec![("-6", gateway.to_string())]),
        Protocol::Dual => {
            let mut parts = gateway.split(',');
            let (Some(v4), Some(v6)) = (parts.next(), parts.next()) else {
                return Err(Error::Validation(format!(
                    "dual stack gateway {gateway} needs a v4,v6 pair"
                )));
            };
            Ok(vec![("-4", v4.trim().to_string()), ("-6", v6.trim().to_string())])
        }
    }
}

/// ADD must not report success before the first hop answers. Each probe
/// waits at most a second, giving the same one-per-second cadence as the
/// probe ceiling.
async fn wait_network_ready(netns: &str, gateway: &str) -> Result<()> {
    let gw = gateway.split(',').next().unwrap_or(gateway).trim();
    let family = if gw.contains(':') { "-6" } else { "-4" };
    for sent in 1..=PING_COUNT {
        if run_in_netns(netns, &args(&["ping", family, "-c", "1", "-W", "1", gw]))
            .await
            .is_ok()
        {
            info!("network ready after {} ping", sent);
            return Ok(());
        }
    }
    Err(Error::NetworkNotReady(format!(
        "network not ready after {PING_COUNT} ping"
    )))
}

/// iproute2 only enters named namespaces; a netns handed over as a bare
/// proc path gets bind-mounted under /var/run/netns first.
async fn ensure_named_netns(netns_path: &str, container_id: &str) -> Result<String> {
    if let Some(name) = named_netns(netns_path) {
        return Ok(name);
    }
    let name = short_id(container_id).to_string();
    fs::create_dir_all(NETNS_DIR)?;
    let target = format!("{NETNS_DIR}/{name}");
    fs::File::create(&target)?;
    run("mount", &args(&["--bind", netns_path, &target])).await?;
    Ok(name)
}

fn named_netns(netns_path: &str) -> Option<String> {
    let path = Path::new(netns_path);
    let parent = path.parent()?;
    if parent == Path::new(NETNS_DIR) || parent == Path::new("/run/netns") {
        return Some(path.file_name()?.to_string_lossy().to_string());
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_nic_name_truncates_to_twelve() {
        let (host, container) = generate_nic_name("abcdef123456789");
        assert_eq!(host, "abcdef123456_h");
        assert_eq!(container, "abcdef123456_c");

        let (host, _) = generate_nic_name("short");
        assert_eq!(host, "short_h");
    }

    #[test]
    fn test_default_routes_dual_installs_v4_first() {
        let routes = default_routes(Protocol::Dual, "10.16.0.1,fd00::1").expect("dual gateways");
        assert_eq!(routes[0], ("-4", "10.16.0.1".to_string()));
        assert_eq!(routes[1], ("-6", "fd00::1".to_string()));

        assert!(default_routes(Protocol::Dual, "10.16.0.1").is_err());
        assert_eq!(
            default_routes(Protocol::IPv6, "fd00::1").expect("v6 gateway"),
            vec![("-6", "fd00::1".to_string())]
        );
    }

    #[test]
    fn test_named_netns_detection() {
        assert_eq!(
            named_netns("/var/run/netns/cni-1234").as_deref(),
            Some("cni-1234")
        );
        assert_eq!(named_netns("/run/netns/sandbox").as_deref(), Some("sandbox"));
        assert_eq!(named_netns("/proc/4242/ns/net"), None);
    }

    #[test]
    fn test_representor_port_matching() {
        assert!(representor_port_matches("pf0vf3", 3));
        assert!(representor_port_matches("vf3", 3));
        assert!(!representor_port_matches("pf0vf30", 3));
        assert!(!representor_port_matches("p0", 3));
    }
}

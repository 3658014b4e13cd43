use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Cluster-wide subnet controller
    Controller(ControllerArgs),
    /// Per-node CNI server
    Daemon(DaemonArgs),
    /// Print the CustomResourceDefinition manifests
    CrdGen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Address of the OVN northbound database
    #[arg(long, env = "OVN_NB_ADDRESS", default_value = "tcp:127.0.0.1:6641")]
    pub ovn_nb_address: String,

    /// Timeout in seconds passed to ovn-nbctl
    #[arg(long, env = "OVN_TIMEOUT", default_value_t = 30)]
    pub ovn_timeout: u32,

    /// Name of the cluster logical router
    #[arg(long, env = "CLUSTER_ROUTER", default_value = "ovn-cluster")]
    pub cluster_router: String,

    /// Name of the default logical switch
    #[arg(long, env = "DEFAULT_LOGICAL_SWITCH", default_value = "ovn-default")]
    pub default_logical_switch: String,

    /// Name of the logical switch that connects nodes to the overlay
    #[arg(long, env = "NODE_SWITCH", default_value = "join")]
    pub node_switch: String,

    /// Cluster network type, "geneve" or "vlan"
    #[arg(long, env = "NETWORK_TYPE", default_value = "geneve")]
    pub network_type: String,

    /// Vlan bound to subnets that do not name one, when the network type is vlan
    #[arg(long, env = "DEFAULT_VLAN_NAME", default_value = "ovn-vlan")]
    pub default_vlan_name: String,
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    /// Name of the node the daemon is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Unix socket the CNI shim posts add/del requests to
    #[arg(
        long,
        env = "CNI_SERVER_SOCKET",
        default_value = "/run/ovn-cni/cni-server.sock"
    )]
    pub socket_path: PathBuf,

    /// MTU for pod interfaces
    #[arg(long, env = "MTU", default_value_t = 1400)]
    pub mtu: u32,

    /// Cluster network type, "geneve" or "vlan"
    #[arg(long, env = "NETWORK_TYPE", default_value = "geneve")]
    pub network_type: String,

    /// Physical interface bridged into br-provider for vlan networks
    #[arg(long, env = "PROVIDER_NIC", default_value = "")]
    pub provider_nic: String,

    /// CNI server log directory
    #[arg(long, env = "CNI_LOG_DIR", default_value = "/var/log/ovn-cni")]
    pub log_dir: PathBuf,
}

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use crate::netid;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Controller(ControllerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// IPv4 CIDR all node subnets are carved from
    #[arg(long, default_value = "10.128.0.0/14")]
    pub cluster_cidr: String,

    /// Bits appended to the cluster prefix for each node subnet
    #[arg(long, default_value_t = 9)]
    pub host_subnet_bits: u32,

    /// IPv4 CIDR of service cluster IPs
    #[arg(long, default_value = "172.30.0.0/16")]
    pub service_cidr: String,

    /// Lowest allocatable VNID
    #[arg(long, default_value_t = netid::MIN_VNID)]
    pub vnid_min: u32,

    /// Highest allocatable VNID
    #[arg(long, default_value_t = netid::MAX_VNID)]
    pub vnid_max: u32,

    /// MTU of the overlay interfaces
    #[arg(long, default_value_t = 1450)]
    pub mtu: u32,

    /// Name of the node the program is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// IP of the node the program is running on
    #[arg(long, env = "NODE_IP")]
    pub node_ip: String,

    /// Readiness and metrics listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub status_address: SocketAddr,

    /// Run the master reconcilers
    #[arg(long)]
    pub master: bool,

    /// Run the node view
    #[arg(long)]
    pub node: bool,
}

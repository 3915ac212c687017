use anyhow::Result;
use argh::FromArgs;
use serde::Serialize;
use std::path::Path;

use ifprobe::{pci, rdma, sysfs};

/// Probe network interfaces, PCI topology and RDMA links from sysfs
#[derive(FromArgs, Debug)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Commands {
    List(ListCmd),
    Rdma(RdmaCmd),
}

/// List network interfaces with PCI and SR-IOV detail
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "list")]
struct ListCmd {
    /// output format: table or json
    #[argh(option, short = 'f', default = "OutputFormat::Table")]
    format: OutputFormat,
}

/// List RDMA links with their netdevs and char devices
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "rdma")]
struct RdmaCmd {
    /// output format: table or json
    #[argh(option, short = 'f', default = "OutputFormat::Table")]
    format: OutputFormat,
}

#[derive(Debug, Clone)]
enum OutputFormat {
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid format: {} (expected: table, json)", s)),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::List(cmd) => run_list(cmd.format),
        Commands::Rdma(cmd) => run_rdma(cmd.format),
    }
}

#[derive(Debug, Serialize)]
struct InterfaceEntry {
    name: String,
    pci_addr: Option<String>,
    vendor: Option<String>,
    device: Option<String>,
    numa_node: Option<i64>,
    is_vf: bool,
    sriov_vfs: Option<u32>,
    operstate: Option<String>,
}

fn run_list(format: OutputFormat) -> Result<()> {
    let net_root = Path::new(sysfs::NET_CLASS);
    let interfaces = sysfs::list_net_interfaces(net_root)?;

    let entries: Vec<InterfaceEntry> = interfaces
        .iter()
        .map(|iface| {
            let device_path = sysfs::device_dir(net_root, &iface.name);
            let ids = iface
                .has_device
                .then(|| pci::read_ids(&device_path))
                .flatten();
            InterfaceEntry {
                name: iface.name.clone(),
                pci_addr: iface.pci_addr.clone(),
                vendor: ids.map(|i| format!("{:#06x}", i.vendor)),
                device: ids.map(|i| format!("{:#06x}", i.device)),
                numa_node: pci::numa_node(&device_path),
                is_vf: iface.is_vf,
                sriov_vfs: iface.sriov_numvfs,
                operstate: iface.operstate.clone(),
            }
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            println!(
                "{:<15} | {:<12} | {:<8} | {:<8} | {:<4} | {:<5} | {}",
                "Interface", "PCI", "Vendor", "Device", "NUMA", "VFs", "State"
            );
            println!("{}", "=".repeat(75));
            for e in &entries {
                println!(
                    "{:<15} | {:<12} | {:<8} | {:<8} | {:<4} | {:<5} | {}",
                    e.name,
                    e.pci_addr.as_deref().unwrap_or("-"),
                    e.vendor.as_deref().unwrap_or("-"),
                    e.device.as_deref().unwrap_or("-"),
                    e.numa_node.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    e.sriov_vfs.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    e.operstate.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct RdmaEntry {
    name: String,
    node_guid: Option<String>,
    fw_version: Option<String>,
    netdevs: Vec<String>,
    char_devices: Vec<String>,
}

fn run_rdma(format: OutputFormat) -> Result<()> {
    let ib_root = Path::new(rdma::IB_CLASS);
    let links = rdma::list_links(ib_root)?;

    let entries: Vec<RdmaEntry> = links
        .iter()
        .map(|link| RdmaEntry {
            name: link.name.clone(),
            node_guid: link.node_guid.clone(),
            fw_version: link.fw_version.clone(),
            netdevs: link.netdevs.clone(),
            char_devices: rdma::char_device_names(ib_root, &link.name),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            println!(
                "{:<10} | {:<20} | {:<12} | {:<15} | {}",
                "Link", "Node GUID", "Firmware", "Netdevs", "Char devices"
            );
            println!("{}", "=".repeat(85));
            for e in &entries {
                println!(
                    "{:<10} | {:<20} | {:<12} | {:<15} | {}",
                    e.name,
                    e.node_guid.as_deref().unwrap_or("-"),
                    e.fw_version.as_deref().unwrap_or("-"),
                    e.netdevs.join(","),
                    e.char_devices.join(","),
                );
            }
        }
    }

    Ok(())
}

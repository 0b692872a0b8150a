//! Direct revert commands
//!
//! These talk to the hypervisor using the local config file, without the
//! admin service.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use livefire_common::{
    LivefireConfig, PowerOnReceipt, RevertReceipt, SnapshotNode, SnapshotRevert, VmRef,
    VsphereConnector,
};

use crate::output::{print_item, print_list, print_success, print_warning, spinner, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RevertArgs {
    /// VM name as shown by the hypervisor
    pub vm: String,

    /// Snapshot name (defaults to the configured baseline)
    #[arg(short, long)]
    pub snapshot: Option<String>,
}

#[derive(Args)]
pub struct VmArgs {
    /// VM name as shown by the hypervisor
    pub vm: String,
}

#[derive(Args)]
pub struct SnapshotsArgs {
    /// VM name as shown by the hypervisor
    pub vm: String,

    /// Snapshot name to highlight (defaults to the configured baseline)
    #[arg(short, long)]
    pub snapshot: Option<String>,
}

/// Receipt display wrapper for serialization
#[derive(Serialize)]
pub struct ReceiptDisplay {
    pub vm: String,
    pub vm_id: String,
    pub snapshot: String,
    pub snapshot_id: String,
    pub completed_at: String,
}

impl From<&RevertReceipt> for ReceiptDisplay {
    fn from(receipt: &RevertReceipt) -> Self {
        Self {
            vm: receipt.vm.name.clone(),
            vm_id: receipt.vm.id.clone(),
            snapshot: receipt.snapshot.name.clone(),
            snapshot_id: receipt.snapshot.id.clone(),
            completed_at: receipt.completed_at.to_rfc3339(),
        }
    }
}

impl From<&PowerOnReceipt> for ReceiptDisplay {
    fn from(receipt: &PowerOnReceipt) -> Self {
        Self {
            vm: receipt.vm.name.clone(),
            vm_id: receipt.vm.id.clone(),
            snapshot: "-".to_string(),
            snapshot_id: "-".to_string(),
            completed_at: receipt.completed_at.to_rfc3339(),
        }
    }
}

impl TableDisplay for ReceiptDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["VM", "VM ID", "Snapshot", "Snapshot ID", "Completed"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.vm.clone(),
            self.vm_id.clone(),
            self.snapshot.clone(),
            self.snapshot_id.clone(),
            self.completed_at.clone(),
        ]
    }
}

/// One snapshot tree node, flattened for table output
#[derive(Serialize)]
pub struct SnapshotRow {
    pub depth: usize,
    pub name: String,
    pub id: String,
    pub matches: bool,
}

impl TableDisplay for SnapshotRow {
    fn headers() -> Vec<&'static str> {
        vec!["Snapshot", "ID", "Match"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            format!("{}{}", "  ".repeat(self.depth), self.name),
            self.id.clone(),
            if self.matches { "*".to_string() } else { String::new() },
        ]
    }
}

/// Flatten a snapshot tree depth-first, marking nodes named `wanted`
pub fn flatten_tree(roots: &[SnapshotNode], wanted: &str) -> Vec<SnapshotRow> {
    fn walk(nodes: &[SnapshotNode], depth: usize, wanted: &str, out: &mut Vec<SnapshotRow>) {
        for node in nodes {
            out.push(SnapshotRow {
                depth,
                name: node.name.clone(),
                id: node.id.clone(),
                matches: node.name == wanted,
            });
            walk(&node.children, depth + 1, wanted, out);
        }
    }

    let mut rows = Vec::new();
    walk(roots, 0, wanted, &mut rows);
    rows
}

/// Nested view used for JSON and YAML output
#[derive(Serialize)]
pub struct SnapshotTreeView<'a> {
    pub vm: &'a VmRef,
    pub snapshot_name: &'a str,
    pub matches: usize,
    pub snapshots: &'a [SnapshotNode],
}

/// Print a VM's snapshot tree
pub fn print_snapshot_tree(vm: &VmRef, snapshots: &[SnapshotNode], wanted: &str, format: OutputFormat) {
    let rows = flatten_tree(snapshots, wanted);
    let matches = rows.iter().filter(|r| r.matches).count();

    match format {
        OutputFormat::Json | OutputFormat::Yaml => {
            let view = SnapshotTreeView {
                vm,
                snapshot_name: wanted,
                matches,
                snapshots,
            };
            let rendered = if format == OutputFormat::Json {
                serde_json::to_string_pretty(&view).unwrap_or_default()
            } else {
                serde_yaml::to_string(&view).unwrap_or_default()
            };
            println!("{}", rendered);
        }
        OutputFormat::Table | OutputFormat::Plain => {
            print_list(&rows, format);
            if matches != 1 {
                print_warning(&format!(
                    "{} snapshots named '{}' on VM '{}'; a revert needs exactly one",
                    matches, wanted, vm.name
                ));
            }
        }
    }
}

fn reverter(config: &LivefireConfig) -> SnapshotRevert {
    SnapshotRevert::new(Arc::new(VsphereConnector::new()), config.revert_options())
}

pub async fn revert(args: RevertArgs, config: &LivefireConfig, format: OutputFormat) -> Result<()> {
    let params = config.connection_params()?;
    let snapshot = args
        .snapshot
        .unwrap_or_else(|| config.revert.snapshot_name.clone());

    let pb = spinner(format!("Reverting {} to {}", args.vm, snapshot));
    let result = reverter(config).revert(&params, &args.vm, &snapshot).await;
    pb.finish_and_clear();

    match result {
        Ok(receipt) => {
            print_success(&format!("VM '{}' reverted to '{}' and powered on", args.vm, snapshot));
            print_item(&ReceiptDisplay::from(&receipt), format);
            Ok(())
        }
        Err(e) => {
            if e.is_partial() {
                print_warning(&format!(
                    "VM '{}' was reverted but is not running; retry with `livefire power-on {}`",
                    args.vm, args.vm
                ));
            }
            Err(e.into())
        }
    }
}

pub async fn power_on(args: VmArgs, config: &LivefireConfig, format: OutputFormat) -> Result<()> {
    let params = config.connection_params()?;

    let pb = spinner(format!("Powering on {}", args.vm));
    let result = reverter(config).power_on(&params, &args.vm).await;
    pb.finish_and_clear();

    let receipt = result?;
    print_success(&format!("VM '{}' powered on", args.vm));
    print_item(&ReceiptDisplay::from(&receipt), format);
    Ok(())
}

pub async fn snapshots(args: SnapshotsArgs, config: &LivefireConfig, format: OutputFormat) -> Result<()> {
    let params = config.connection_params()?;
    let wanted = args
        .snapshot
        .unwrap_or_else(|| config.revert.snapshot_name.clone());

    let (vm, tree) = reverter(config).snapshot_tree(&params, &args.vm).await?;
    print_snapshot_tree(&vm, &tree, &wanted, format);
    Ok(())
}

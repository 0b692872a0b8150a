//! Target Commands
//!
//! Manage revert targets through the admin service.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use livefire_common::{RevertEvent, RevertTarget};

use crate::client::{AdminClient, ServiceError, TargetUpdate};
use crate::commands::revert::{print_snapshot_tree, ReceiptDisplay};
use crate::output::{
    format_timestamp, print_item, print_list, print_message, print_success, print_warning, spinner,
    OutputFormat, TableDisplay,
};

#[derive(Subcommand)]
pub enum TargetCommands {
    /// List all targets
    List,

    /// Get target details
    Get {
        /// Target ID or name
        id: String,
    },

    /// Register a new target
    Add {
        /// Target name, e.g. the challenge name
        name: String,

        /// VM name on the hypervisor
        #[arg(long)]
        vm: String,

        /// Snapshot override (defaults to the service's baseline)
        #[arg(short, long)]
        snapshot: Option<String>,
    },

    /// Update a target
    Update {
        /// Target ID or name
        id: String,

        /// New target name
        #[arg(long)]
        name: Option<String>,

        /// New VM name
        #[arg(long)]
        vm: Option<String>,

        /// New snapshot override
        #[arg(short, long, conflicts_with = "clear_snapshot")]
        snapshot: Option<String>,

        /// Drop the snapshot override
        #[arg(long)]
        clear_snapshot: bool,
    },

    /// Remove a target
    Remove {
        /// Target ID or name
        id: String,
    },

    /// Revert a target's VM to its snapshot and power it on
    Revert {
        /// Target ID or name
        id: String,
    },

    /// Power on a target's VM without reverting
    PowerOn {
        /// Target ID or name
        id: String,
    },

    /// Show the snapshot tree of a target's VM
    Snapshots {
        /// Target ID or name
        id: String,
    },

    /// Show a target's revert history
    Events {
        /// Target ID or name
        id: String,

        /// Maximum number of events
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Target display wrapper for serialization
#[derive(Serialize)]
pub struct TargetDisplay {
    pub id: String,
    pub name: String,
    pub vm_name: String,
    pub snapshot_name: Option<String>,
    pub last_revert_at: String,
}

impl From<RevertTarget> for TargetDisplay {
    fn from(target: RevertTarget) -> Self {
        Self {
            last_revert_at: format_timestamp(target.last_revert_at),
            id: target.id,
            name: target.name,
            vm_name: target.vm_name,
            snapshot_name: target.snapshot_name,
        }
    }
}

impl TableDisplay for TargetDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "VM", "Snapshot", "Last Revert"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.vm_name.clone(),
            self.snapshot_name
                .clone()
                .unwrap_or_else(|| "(baseline)".to_string()),
            self.last_revert_at.clone(),
        ]
    }
}

/// Event display wrapper for serialization
#[derive(Serialize)]
pub struct EventDisplay {
    pub created_at: String,
    pub action: String,
    pub outcome: String,
    pub vm_name: String,
    pub snapshot_name: Option<String>,
    pub message: String,
}

impl From<RevertEvent> for EventDisplay {
    fn from(event: RevertEvent) -> Self {
        Self {
            created_at: format_timestamp(Some(event.created_at)),
            action: event.action,
            outcome: event.outcome.to_string(),
            vm_name: event.vm_name,
            snapshot_name: event.snapshot_name,
            message: event.message,
        }
    }
}

impl TableDisplay for EventDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Time", "Action", "Outcome", "VM", "Snapshot", "Message"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.created_at.clone(),
            self.action.clone(),
            self.outcome.clone(),
            self.vm_name.clone(),
            self.snapshot_name.clone().unwrap_or_else(|| "-".to_string()),
            self.message.clone(),
        ]
    }
}

fn update_from_flags(
    name: Option<String>,
    vm: Option<String>,
    snapshot: Option<String>,
    clear_snapshot: bool,
) -> TargetUpdate {
    TargetUpdate {
        name,
        vm_name: vm,
        snapshot_name: if clear_snapshot {
            Some(String::new())
        } else {
            snapshot
        },
    }
}

pub async fn execute(cmd: TargetCommands, client: AdminClient, format: OutputFormat) -> Result<()> {
    match cmd {
        TargetCommands::List => {
            let targets = client.list_targets().await?;
            let displays: Vec<TargetDisplay> = targets.into_iter().map(TargetDisplay::from).collect();
            print_list(&displays, format);
        }

        TargetCommands::Get { id } => {
            let target = client.get_target(&id).await?;
            print_item(&TargetDisplay::from(target), format);
        }

        TargetCommands::Add { name, vm, snapshot } => {
            let target = client.create_target(&name, &vm, snapshot).await?;
            print_success(&format!("Target '{}' registered for VM '{}'", target.name, target.vm_name));
            print_item(&TargetDisplay::from(target), format);
        }

        TargetCommands::Update {
            id,
            name,
            vm,
            snapshot,
            clear_snapshot,
        } => {
            let update = update_from_flags(name, vm, snapshot, clear_snapshot);
            let target = client.update_target(&id, &update).await?;
            print_success(&format!("Target '{}' updated", target.name));
            print_item(&TargetDisplay::from(target), format);
        }

        TargetCommands::Remove { id } => {
            client.delete_target(&id).await?;
            print_message(&format!("Target '{}' removed", id), format);
        }

        TargetCommands::Revert { id } => {
            let pb = spinner(format!("Reverting target {}", id));
            let result = client.revert_target(&id).await;
            pb.finish_and_clear();

            match result {
                Ok(response) => {
                    print_success(&format!(
                        "Target '{}' reverted to '{}'",
                        response.target.name, response.receipt.snapshot.name
                    ));
                    print_item(&ReceiptDisplay::from(&response.receipt), format);
                }
                Err(e) => {
                    if e.downcast_ref::<ServiceError>().map(|s| s.partial).unwrap_or(false) {
                        print_warning(&format!(
                            "VM was reverted but is not running; retry with `livefire target power-on {}`",
                            id
                        ));
                    }
                    return Err(e);
                }
            }
        }

        TargetCommands::PowerOn { id } => {
            let pb = spinner(format!("Powering on target {}", id));
            let result = client.power_on_target(&id).await;
            pb.finish_and_clear();

            let response = result?;
            print_success(&format!("Target '{}' powered on", response.target.name));
            print_item(&ReceiptDisplay::from(&response.receipt), format);
        }

        TargetCommands::Snapshots { id } => {
            let response = client.snapshots(&id).await?;
            print_snapshot_tree(&response.vm, &response.snapshots, &response.snapshot_name, format);
        }

        TargetCommands::Events { id, limit } => {
            let events = client.events(&id, limit).await?;
            let displays: Vec<EventDisplay> = events.into_iter().map(EventDisplay::from).collect();
            print_list(&displays, format);
        }
    }

    Ok(())
}

//! Background partition maintenance
//!
//! A single Tokio task keeps partitions provisioned ahead of time so the
//! write path never routes to the catch-all under normal operation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            MaintenanceHandle (Clone)                  │
//! │     run_now() / shutdown() over a bounded mailbox     │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │          PartitionMaintenance (single task)           │
//! │   interval tick or RunNow → ensure_provisioned()     │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::{partition::PartitionManager, Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Message sent to the maintenance task
#[derive(Debug)]
pub enum MaintenanceMessage {
    /// Provision now and report the partitions created
    RunNow {
        /// Reply channel
        response: oneshot::Sender<Result<Vec<String>>>,
    },

    /// Stop the task
    Shutdown,
}

/// Task that provisions partitions on an interval
#[derive(Debug)]
pub struct PartitionMaintenance {
    partitions: Arc<PartitionManager>,
    mailbox: mpsc::Receiver<MaintenanceMessage>,
    horizon: u32,
    period: Duration,
}

impl PartitionMaintenance {
    /// Create the task state
    pub fn new(
        partitions: Arc<PartitionManager>,
        mailbox: mpsc::Receiver<MaintenanceMessage>,
        horizon: u32,
        period: Duration,
    ) -> Self {
        Self {
            partitions,
            mailbox,
            horizon,
            period,
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(MaintenanceMessage::RunNow { response }) => {
                            let _ = response.send(self.provision());
                        }
                        Some(MaintenanceMessage::Shutdown) | None => break,
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.provision() {
                        tracing::error!(error = %e, "Partition maintenance failed");
                    }
                }
            }
        }

        tracing::info!("Partition maintenance stopped");
    }

    fn provision(&self) -> Result<Vec<String>> {
        let created = self.partitions.ensure_provisioned(self.horizon, Utc::now())?;
        if !created.is_empty() {
            tracing::info!(created = ?created, "Partition maintenance provisioned partitions");
        }
        Ok(created)
    }
}

/// Handle for sending messages to the maintenance task
#[derive(Debug, Clone)]
pub struct MaintenanceHandle {
    sender: mpsc::Sender<MaintenanceMessage>,
}

impl MaintenanceHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<MaintenanceMessage>) -> Self {
        Self { sender }
    }

    /// Provision immediately
    pub async fn run_now(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MaintenanceMessage::RunNow { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Maintenance mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Stop the task
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(MaintenanceMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Maintenance mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the maintenance task
///
/// The join handle resolves once the task has stopped and released its
/// partition manager.
pub fn spawn_partition_maintenance(
    partitions: Arc<PartitionManager>,
    horizon: u32,
    period: Duration,
) -> (MaintenanceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let task = PartitionMaintenance::new(partitions, rx, horizon, period);

    let join = tokio::spawn(async move {
        task.run().await;
    });

    (MaintenanceHandle::new(tx), join)
}

use hunter_core::{HuntingTask, PublicIpNotification};
use tokio::sync::mpsc;
use tracing::warn;

/// Receiving side of admitted work. Calls must not block; the pipeline never
/// waits for a task to run.
pub trait ExecutionSink: Send + Sync {
    fn add_task(&self, task: HuntingTask);
    fn add_public_ip(&self, notification: PublicIpNotification);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handoff {
    Task(HuntingTask),
    PublicIp(PublicIpNotification),
}

/// Forwards handoffs over an unbounded channel to whatever runs the probes.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Handoff>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Handoff>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, handoff: Handoff) {
        if let Err(e) = self.tx.send(handoff) {
            warn!("execution subsystem is gone; dropped {:?}", e.0);
        }
    }
}

impl ExecutionSink for ChannelSink {
    fn add_task(&self, task: HuntingTask) {
        self.send(Handoff::Task(task));
    }

    fn add_public_ip(&self, notification: PublicIpNotification) {
        self.send(Handoff::PublicIp(notification));
    }
}

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::{RowKey, write::Replicator};

enum WorkerMessage {
    Repair(RowKey),
    Flush(Sender<()>),
    Shutdown(Sender<()>),
}

/// Repairs under-replicated rows on a background thread, so gaps left
/// by failed tails close without waiting for a read.
///
/// The queue is bounded. When it is full, new keys are dropped and left
/// to read repair.
pub(crate) struct Reconciler {
    outbox: Sender<WorkerMessage>,
    join_handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    pub(crate) fn spawn(
        replicator: Arc<Replicator>,
        queue_depth: usize,
    ) -> std::io::Result<Reconciler> {
        let (tx, rx) = bounded(queue_depth.max(1));

        let join_handle = thread::Builder::new()
            .name("rtable_repair".into())
            .spawn(move || worker(rx, replicator))?;

        Ok(Reconciler { outbox: tx, join_handle: Some(join_handle) })
    }

    pub(crate) fn enqueue(&self, key: RowKey) {
        match self.outbox.try_send(WorkerMessage::Repair(key)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("repair queue full, leaving a row to read repair");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("repair thread is gone, leaving a row to read repair");
            }
        }
    }

    /// Blocks until every key queued so far has been processed.
    pub(crate) fn flush(&self) {
        let (tx, rx) = bounded(1);
        if self.outbox.send(WorkerMessage::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        let (tx, rx) = bounded(1);
        if self.outbox.send(WorkerMessage::Shutdown(tx)).is_ok() {
            let _ = rx.recv();
        }

        if let Some(join_handle) = self.join_handle.take() {
            if let Err(e) = join_handle.join() {
                log::error!("error joining repair thread: {:?}", e);
            }
        }
    }
}

fn worker(rx: Receiver<WorkerMessage>, replicator: Arc<Replicator>) {
    for message in rx {
        match message {
            WorkerMessage::Repair(key) => {
                let view = match replicator.views.current_view() {
                    Ok(view) => view,
                    Err(e) => {
                        log::warn!("skipping background repair of {}: {}", key, e);
                        continue;
                    }
                };
                match replicator.repair_key(&view, &key) {
                    Ok(Some(repaired)) if !repaired.complete => {
                        log::debug!("{} is still under-replicated after repair", key);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("background repair of {} failed: {}", key, e),
                }
            }
            WorkerMessage::Flush(tx) => {
                let _ = tx.send(());
            }
            WorkerMessage::Shutdown(tx) => {
                drop(replicator);
                if let Err(e) = tx.send(()) {
                    log::error!("repair thread failed to send shutdown ack: {e:?}");
                }
                return;
            }
        }
    }
}

//! Background worker migrating queued page ranges to the secondary store

use crate::memory::{file::Shared, ranges::FileRange};
use std::sync::{mpsc, Arc};

pub(super) enum WorkerMsg {
    Unload(FileRange),
    Shutdown,
}

pub(super) fn run(shared: Arc<Shared>, rx: mpsc::Receiver<WorkerMsg>) {
    log::debug!("page loader started");
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Unload(range) => {
                if let Err(err) = shared.unload_parts(range) {
                    log::warn!("async unload of {} failed: {}", range, err);
                }
            }
            WorkerMsg::Shutdown => break,
        }
    }
    log::debug!("page loader exiting");
}

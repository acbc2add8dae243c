// Copyright 2025 Oxide Computer Company
use std::fmt::Debug;
use std::sync::{mpsc, Arc};

use bytes::Bytes;
use ddt_common::ddt_bail;

use crate::repair::RepairTicket;
use crate::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoPriority {
    SyncRead,
    SyncWrite,
    AsyncWrite,
}

/// Block-level I/O the dedup table asks for but does not perform.
pub trait BlockIo: Send + Sync + Debug {
    /// Free the physical copy `phys` of `key`, as of `txg`.
    fn free_block(
        &self,
        checksum: ChecksumAlgo,
        key: &Key,
        phys: &Phys,
        txg: u64,
    );

    /// Write `data` over the copy `bp` points at. Complete `req` once the
    /// write is done, from any thread; dropping it unsent is seen by the
    /// waiter as a failure.
    fn rewrite_block(
        &self,
        bp: &BlockPointer,
        data: Bytes,
        priority: IoPriority,
        req: RewriteReq,
    );
}

/// Told when an entry moves to a hotter class, so a running scrub that has
/// already passed that class does not miss it.
pub trait ScanNotifier: Send + Sync + Debug {
    fn class_decreased(&self, checksum: ChecksumAlgo, record: &DdtRecord, txg: u64);
}

/**
 * Couple a repair rewrite with a notifier for the sync that issued it. This
 * uses a single-use channel to send the result of the write, and is meant to
 * be paired with a RewriteWaiter.
 *
 * Each request also holds the repair it belongs to. The repair is released
 * when the last of its requests is completed or dropped.
 */
#[must_use]
#[derive(Debug)]
pub struct RewriteReq {
    sender: mpsc::Sender<Result<(), DdtError>>,
    repair: Arc<RepairTicket>,
}

impl RewriteReq {
    pub(crate) fn new(
        repair: Arc<RepairTicket>,
    ) -> (RewriteReq, RewriteWaiter) {
        let (sender, recv) = mpsc::channel();
        (RewriteReq { sender, repair }, RewriteWaiter { recv })
    }

    /// The content being repaired.
    pub fn key(&self) -> &Key {
        self.repair.key()
    }

    /// Consume this RewriteReq and send Ok to the waiter
    pub fn send_ok(self) {
        self.send_result(Ok(()));
    }

    /// Consume this RewriteReq and send an Err to the waiter
    pub fn send_err(self, e: DdtError) {
        self.send_result(Err(e));
    }

    pub fn send_result(self, r: Result<(), DdtError>) {
        // The sync may have stopped waiting; nobody else wants the result.
        let _ = self.sender.send(r);
    }
}

/**
 * The sync side of a RewriteReq: blocks until the write completes.
 */
#[must_use]
#[derive(Debug)]
pub struct RewriteWaiter {
    recv: mpsc::Receiver<Result<(), DdtError>>,
}

impl RewriteWaiter {
    /// Consume this RewriteWaiter and wait on the message
    pub fn wait(self) -> Result<(), DdtError> {
        match self.recv.recv() {
            Ok(v) => v,
            Err(_) => ddt_bail!(RecvDisconnected),
        }
    }

    pub fn try_wait(&mut self) -> Option<Result<(), DdtError>> {
        match self.recv.try_recv() {
            Ok(v) => Some(v),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                Some(Err(DdtError::RecvDisconnected))
            }
        }
    }
}

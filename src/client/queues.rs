use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::peer::{BlockData, BlockRequest};

/// A queued upload, flagged instead of removed when cancelled so the FIFO
/// order of everything behind it is untouched.
#[derive(Debug)]
pub struct OutgoingBlock {
    pub request: BlockRequest,
    pub cancelled: bool,
}

/// FIFO of blocks remote peers asked us to upload.
#[derive(Default)]
pub struct OutgoingQueue {
    inner: Mutex<VecDeque<OutgoingBlock>>,
}

impl OutgoingQueue {
    pub fn push(&self, request: BlockRequest) {
        self.inner.lock().push_back(OutgoingBlock {
            request,
            cancelled: false,
        });
    }

    pub fn pop(&self) -> Option<OutgoingBlock> {
        self.inner.lock().pop_front()
    }

    /// Marks every queued entry matching this request as cancelled.
    pub fn cancel(&self, request: &BlockRequest) {
        for entry in self.inner.lock().iter_mut() {
            if entry.request == *request {
                entry.cancelled = true;
            }
        }
    }
}

/// FIFO of block payloads waiting to be written to disk.
#[derive(Default)]
pub struct IncomingQueue {
    inner: Mutex<VecDeque<BlockData>>,
}

impl IncomingQueue {
    pub fn push(&self, data: BlockData) {
        self.inner.lock().push_back(data);
    }

    pub fn pop(&self) -> Option<BlockData> {
        self.inner.lock().pop_front()
    }
}

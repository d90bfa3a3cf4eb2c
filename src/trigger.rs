//! Start request signalling between interrupt context and the update worker.

use heapless::spsc::{Consumer, Producer, Queue};

/// One queued request to start an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StartRequest;

// An spsc queue holds N - 1 items, so this gives one pending slot.
const DEPTH: usize = 2;

/// Statically allocatable backing storage for one trigger pair.
pub struct TriggerQueue {
    queue: Queue<StartRequest, DEPTH>,
}

impl TriggerQueue {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Splits into the interrupt side handle and the worker side receiver.
    pub fn split(&mut self) -> (Trigger<'_>, TriggerReceiver<'_>) {
        let (tx, rx) = self.queue.split();
        (Trigger { tx }, TriggerReceiver { rx })
    }
}

impl Default for TriggerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests update sessions. Lock free and safe to call from an interrupt
/// handler.
pub struct Trigger<'a> {
    tx: Producer<'a, StartRequest, DEPTH>,
}

impl Trigger<'_> {
    /// Queues a start request. Returns `false` when one is already pending;
    /// repeated edges collapse into the pending request.
    pub fn request(&mut self) -> bool {
        self.tx.enqueue(StartRequest).is_ok()
    }
}

/// Worker side of the trigger pair.
pub struct TriggerReceiver<'a> {
    rx: Consumer<'a, StartRequest, DEPTH>,
}

impl TriggerReceiver<'_> {
    /// Takes the pending request, if any.
    pub fn take(&mut self) -> bool {
        self.rx.dequeue().is_some()
    }

    /// Discards requests that piled up while a session was running.
    pub fn drain(&mut self) {
        while self.rx.dequeue().is_some() {}
    }
}

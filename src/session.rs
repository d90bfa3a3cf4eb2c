//! Single update attempt, driven as an explicit state machine.
//!
//! A session owns one stream and borrows the partition store exclusively,
//! so a second session cannot exist while one is running. `step` performs
//! one bounded unit of work; every failure path releases the write handle
//! and lands in `Aborted` with the reason preserved. A session dropped
//! before its terminal state releases the handle the same way.

use crate::config::{Config, CHUNK_BUF_LEN};
use crate::error::AbortReason;
use crate::image::{AppDescriptor, HEADER_PREFIX_LEN};
use crate::store::{PartitionStore, WriteHandle};
use crate::stream::{ImageStream, ReadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Accumulating the image prefix and deciding whether to accept it.
    Admitting,
    /// Streaming the image body into the inactive slot.
    Writing,
    /// Validating the written image and moving the boot pointer.
    Finalizing,
    /// The boot pointer durably names the new image.
    Committed,
    /// The attempt ended without committing. The boot pointer is untouched.
    Aborted(AbortReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted(_))
    }
}

pub struct UpdateSession<'a, S, P>
where
    S: ImageStream,
    P: PartitionStore,
{
    stream: S,
    store: &'a mut P,
    config: &'a Config,
    state: SessionState,
    prefix: heapless::Vec<u8, HEADER_PREFIX_LEN>,
    handle: Option<WriteHandle>,
    written: usize,
}

// Make sure a session abandoned mid transfer gives its write handle back,
// so the store can accept the next attempt.
impl<'a, S, P> Drop for UpdateSession<'a, S, P>
where
    S: ImageStream,
    P: PartitionStore,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.abort(handle);
        }
    }
}

impl<'a, S, P> UpdateSession<'a, S, P>
where
    S: ImageStream,
    P: PartitionStore,
{
    pub fn new(stream: S, store: &'a mut P, config: &'a Config) -> Self {
        Self {
            stream,
            store,
            config,
            state: SessionState::Admitting,
            prefix: heapless::Vec::new(),
            handle: None,
            written: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bytes accepted into the target partition so far, header included.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Performs one bounded unit of work. Terminal states are absorbing.
    pub fn step(&mut self) -> &SessionState {
        match self.state {
            SessionState::Admitting => self.admit(),
            SessionState::Writing => self.transfer(),
            SessionState::Finalizing => self.finish(),
            SessionState::Committed | SessionState::Aborted(_) => {}
        }
        &self.state
    }

    /// Drives the session to a terminal state.
    pub fn run(&mut self) -> &SessionState {
        while !self.state.is_terminal() {
            self.step();
        }
        &self.state
    }

    fn admit(&mut self) {
        let missing = HEADER_PREFIX_LEN - self.prefix.len();
        if missing > 0 {
            let mut buf = [0u8; HEADER_PREFIX_LEN];
            match self.stream.read(&mut buf[..missing]) {
                ReadOutcome::Data(n) => {
                    debug_assert!(n > 0 && n <= missing);
                    self.prefix.extend_from_slice(&buf[..n]).ok();
                    if self.prefix.len() < HEADER_PREFIX_LEN {
                        return;
                    }
                }
                ReadOutcome::EndOfStream | ReadOutcome::TransportError(_) => {
                    warn!(
                        "Stream ended after {} of {} header bytes",
                        self.prefix.len(),
                        HEADER_PREFIX_LEN
                    );
                    self.fail(AbortReason::TruncatedHeader);
                    return;
                }
            }
        }

        let incoming = match AppDescriptor::from_image_prefix(&self.prefix) {
            Some(descriptor) => descriptor,
            None => {
                self.fail(AbortReason::TruncatedHeader);
                return;
            }
        };
        info!("New firmware version: {}", incoming.version);

        if let Some(invalid) = self.store.last_invalid_partition() {
            let rejected = self
                .store
                .read_descriptor(invalid)
                .map_or(false, |d| d.version == incoming.version);
            if rejected {
                warn!(
                    "Version {} already failed to boot from slot {}",
                    incoming.version, invalid.index
                );
                self.fail(AbortReason::RollbackLoopRejected);
                return;
            }
        }

        let running = self.store.running_partition();
        if let Some(current) = self.store.read_descriptor(running) {
            info!("Running firmware version: {}", current.version);
            if current.version == incoming.version {
                info!("Version {} is already running", incoming.version);
                self.fail(AbortReason::AlreadyCurrent);
                return;
            }
        }

        let target = match self.store.next_update_target() {
            Ok(partition) => partition,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };
        let mut handle = match self.store.open_write(target) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };
        match self.store.write(&mut handle, &self.prefix) {
            Ok(()) => {
                info!("Writing image to slot {} at offset {}", target.index, target.offset);
                self.written = handle.written();
                self.handle = Some(handle);
                self.state = SessionState::Writing;
            }
            Err(e) => {
                self.store.abort(handle);
                self.fail(e.into());
            }
        }
    }

    fn transfer(&mut self) {
        let mut chunk = [0u8; CHUNK_BUF_LEN];
        let want = self.config.chunk_len.clamp(1, CHUNK_BUF_LEN);
        match self.stream.read(&mut chunk[..want]) {
            ReadOutcome::Data(n) => {
                debug_assert!(n > 0 && n <= want);
                let handle = match self.handle.as_mut() {
                    Some(handle) => handle,
                    None => {
                        self.fail(AbortReason::PartitionBusy);
                        return;
                    }
                };
                match self.store.write(handle, &chunk[..n]) {
                    Ok(()) => {
                        self.written = handle.written();
                        debug!("Written image length {}", self.written);
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            ReadOutcome::EndOfStream => {
                debug!("Stream complete after {} bytes", self.written);
                self.state = SessionState::Finalizing;
            }
            ReadOutcome::TransportError(e) => {
                warn!("Transport failed after {} bytes", self.written);
                self.fail(AbortReason::TransportFailure(e));
            }
        }
    }

    fn finish(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => {
                self.fail(AbortReason::ImageCorrupt);
                return;
            }
        };
        let target = handle.partition();
        let result = self
            .store
            .finalize(handle)
            .and_then(|()| self.store.commit_boot(target));
        match result {
            Ok(()) => {
                info!(
                    "Update committed, slot {} boots next with {} bytes written",
                    target.index, self.written
                );
                self.state = SessionState::Committed;
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Releases any live write handle and records the terminal reason.
    fn fail(&mut self, reason: AbortReason) {
        if let Some(handle) = self.handle.take() {
            self.store.abort(handle);
        }
        if reason.is_benign() {
            info!("Update session closed: {:?}", reason);
        } else {
            error!("Update session aborted: {:?}", reason);
        }
        self.state = SessionState::Aborted(reason);
    }
}

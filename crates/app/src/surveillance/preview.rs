use std::sync::{Mutex, MutexGuard, PoisonError};

use actix_web::web::Bytes;

/// One encoded preview frame.
#[derive(Clone, Debug)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Bytes,
    /// Position within the current session, starting at 1.
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
}

#[derive(Default)]
struct Slot {
    packet: Option<FramePacket>,
    /// Bumped on every publish so pollers can tell frames apart across
    /// sessions, where `frame_number` restarts.
    sequence: u64,
}

/// Single-slot, overwrite-only holder of the latest annotated frame.
#[derive(Default)]
pub(crate) struct PreviewBuffer {
    slot: Mutex<Slot>,
}

impl PreviewBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the held frame. Returns its sequence number.
    pub(crate) fn publish(&self, packet: FramePacket) -> u64 {
        let mut slot = self.lock();
        slot.sequence += 1;
        slot.packet = Some(packet);
        slot.sequence
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Option<FramePacket> {
        self.lock().packet.clone()
    }

    /// Latest frame if it was published after sequence `seen`.
    pub(crate) fn latest_since(&self, seen: u64) -> Option<(u64, FramePacket)> {
        let slot = self.lock();
        if slot.sequence == seen {
            return None;
        }
        slot.packet.clone().map(|packet| (slot.sequence, packet))
    }

    /// Drop the held frame so a new session never shows the previous one.
    pub(crate) fn clear(&self) {
        self.lock().packet = None;
    }
}

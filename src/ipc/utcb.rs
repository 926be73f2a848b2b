//! Message buffers
//!
//! Every thread owns one UTCB, the fixed-size buffer all its message
//! traffic goes through: IPC payloads, delegated capability slots and
//! delivered signals. The capacities are hard limits; an oversized
//! payload is refused at the source, never truncated.

use super::IpcError;
use crate::cap::Badge;
use crate::signal::Signal;
use heapless::Vec;

/// Payload capacity of a message buffer, in bytes.
pub const UTCB_DATA_SIZE: usize = 512;

/// Capability slots per message.
pub const UTCB_CAP_SLOTS: usize = 4;

/// Per-thread message buffer.
pub struct Utcb {
    data: Vec<u8, UTCB_DATA_SIZE>,
    caps: Vec<Badge, UTCB_CAP_SLOTS>,
    /// Badge identifying the sender of the last received message,
    /// 0 when the sender holds no matching capability.
    badge: u64,
}

impl Utcb {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            caps: Vec::new(),
            badge: 0,
        }
    }

    /// Replace the payload, refusing anything over capacity.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        self.data.clear();
        self.data
            .extend_from_slice(bytes)
            .map_err(|_| IpcError::PayloadTooLarge)
    }

    /// Current payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Attach a capability to the next outgoing message.
    pub fn attach_cap(&mut self, capid: Badge) -> Result<(), IpcError> {
        self.caps.push(capid).map_err(|_| IpcError::TooManyCaps)
    }

    /// Capabilities attached to the last message.
    pub fn caps(&self) -> &[Badge] {
        &self.caps
    }

    /// Sender badge of the last received message.
    pub fn badge(&self) -> u64 {
        self.badge
    }

    pub(crate) fn set_badge(&mut self, badge: u64) {
        self.badge = badge;
    }

    pub(crate) fn take_caps(&mut self) -> Vec<Badge, UTCB_CAP_SLOTS> {
        core::mem::take(&mut self.caps)
    }

    pub(crate) fn put_cap(&mut self, capid: Badge) {
        if self.caps.push(capid).is_err() {
            log::warn!("capability slot overflow, dropping badge {}", capid.raw());
        }
    }

    /// Encode a delivered signal into the payload area.
    pub(crate) fn write_signal(&mut self, signal: Signal) {
        self.data.clear();
        self.caps.clear();
        self.badge = 0;
        // Capacity is far above 16 bytes; these cannot fail.
        let _ = self.data.extend_from_slice(&signal.imprint.to_le_bytes());
        let _ = self.data.extend_from_slice(&signal.num.to_le_bytes());
    }

    /// Decode the signal most recently written to the payload area.
    pub fn read_signal(&self) -> Option<Signal> {
        if self.data.len() < 16 {
            return None;
        }
        let imprint = u64::from_le_bytes(self.data[0..8].try_into().ok()?);
        let num = u64::from_le_bytes(self.data[8..16].try_into().ok()?);
        Some(Signal { imprint, num })
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_is_refused() {
        let mut utcb = Utcb::new();
        let payload = [0u8; UTCB_DATA_SIZE + 1];
        assert_eq!(
            utcb.write_bytes(&payload),
            Err(IpcError::PayloadTooLarge)
        );
        // A refused write leaves no partial payload behind.
        assert!(utcb.bytes().is_empty());

        utcb.write_bytes(&[0u8; UTCB_DATA_SIZE]).unwrap();
        assert_eq!(utcb.bytes().len(), UTCB_DATA_SIZE);
    }

    #[test]
    fn cap_slots_are_bounded() {
        let mut utcb = Utcb::new();
        for raw in 1..=UTCB_CAP_SLOTS as u64 {
            utcb.attach_cap(Badge::from_raw(raw).unwrap()).unwrap();
        }
        assert_eq!(
            utcb.attach_cap(Badge::from_raw(99).unwrap()),
            Err(IpcError::TooManyCaps)
        );
    }

    #[test]
    fn signal_encoding_roundtrip() {
        let mut utcb = Utcb::new();
        assert!(utcb.read_signal().is_none());

        utcb.write_signal(Signal { imprint: 0xabc, num: 3 });
        assert_eq!(
            utcb.read_signal(),
            Some(Signal { imprint: 0xabc, num: 3 })
        );
    }
}

use std::fmt;
use std::net::SocketAddr;

/// Offset of the target MAC within the datagram payload. A magic packet
/// carries six 0xFF synchronization bytes followed by the target MAC
/// repeated sixteen times, so bytes 6..12 hold the first copy.
pub const MAC_OFFSET: usize = 6;

/// Length of a MAC address in bytes.
pub const MAC_LEN: usize = 6;

/// Shortest payload that still contains the full MAC field.
pub const MIN_WOL_LEN: usize = MAC_OFFSET + MAC_LEN;

/// Target MAC extracted from a magic packet, keyed on for duplicate
/// suppression. Not validated as a real hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacKey([u8; MAC_LEN]);

impl fmt::Display for MacKey {
    /// Canonical form: uppercase hex pairs, dash-separated ("01-02-03-04-05-06")
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// A received WOL datagram. The payload is forwarded byte-identical to the
/// broadcast target, so nothing beyond the MAC field is interpreted.
#[derive(Debug, Clone)]
pub struct MagicPacket {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

impl MagicPacket {
    pub fn new(payload: Vec<u8>, source: SocketAddr) -> Self {
        Self { payload, source }
    }
}

/// Extract the dedup key from a raw payload. Returns None when the buffer
/// is too short to contain the MAC field.
pub fn extract_mac_key(payload: &[u8]) -> Option<MacKey> {
    if payload.len() < MIN_WOL_LEN {
        return None;
    }

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&payload[MAC_OFFSET..MAC_OFFSET + MAC_LEN]);
    Some(MacKey(mac))
}

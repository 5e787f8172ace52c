//! Packet scratch buffer with the fixed on-wire layout.
//!
//! Every worker queue owns one buffer of `MAX_PACKET_LENGTH` bytes that is
//! reused for each packet. The regions below never overlap:
//!
//! ```text
//!  offset  length  field
//!    0       4     peer private IPv4 (cleartext)
//!    4      12     AEAD nonce
//!   16       N     packet body (plaintext on the tunnel side, ciphertext on the wire)
//!  16+N     16     AEAD authentication tag
//! ```

/// Start of the private IP region.
pub const IP_START: usize = 0;
/// End of the private IP region.
pub const IP_END: usize = 4;
/// Length of the private IP header.
pub const IP_LENGTH: usize = 4;

/// Start of the nonce region.
pub const NONCE_START: usize = 4;
/// End of the nonce region.
pub const NONCE_END: usize = 16;
/// Length of the AEAD nonce.
pub const NONCE_LENGTH: usize = 12;

/// Length of the AEAD authentication tag.
pub const TAG_LENGTH: usize = 16;

/// Start of the packet body.
pub const PACKET_START: usize = 16;

/// Size of the prepended data (private IP + nonce).
pub const HEADER_SIZE: usize = IP_LENGTH + NONCE_LENGTH;

/// Size of the appended data (authentication tag).
pub const FOOTER_SIZE: usize = TAG_LENGTH;

/// The maximum datagram size to send via the UDP socket.
pub const MAX_PACKET_LENGTH: usize = 65_500;

/// The max size packet to receive from the tunnel device.
pub const MTU: usize = MAX_PACKET_LENGTH - HEADER_SIZE - FOOTER_SIZE;

/// A view over one worker queue's scratch buffer plus the current logical
/// length of the packet held in it.
pub struct Payload<'a> {
    raw: &'a mut [u8],
    length: usize,
}

impl<'a> Payload<'a> {
    /// Wrap a buffer that was filled by a tunnel read of `n` body bytes.
    /// The body sits at `PACKET_START..PACKET_START + n`, leaving the header
    /// region free for the pipeline to fill in place.
    pub fn from_tunnel(raw: &'a mut [u8], n: usize) -> Self {
        Self {
            raw,
            length: HEADER_SIZE + n,
        }
    }

    /// Wrap a buffer that was filled by a socket read of a whole `n`-byte
    /// datagram starting at offset zero.
    pub fn from_socket(raw: &'a mut [u8], n: usize) -> Self {
        Self { raw, length: n }
    }

    /// Total logical length, header and tag included where present.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Set the total logical length.
    pub fn set_length(&mut self, length: usize) {
        debug_assert!(length <= self.raw.len());
        self.length = length;
    }

    /// The bytes that go on the wire.
    pub fn wire(&self) -> &[u8] {
        &self.raw[..self.length]
    }

    /// The cleartext private IP region.
    pub fn peer_ip(&self) -> &[u8] {
        &self.raw[IP_START..IP_END]
    }

    /// Mutable private IP region.
    pub fn peer_ip_mut(&mut self) -> &mut [u8] {
        &mut self.raw[IP_START..IP_END]
    }

    /// The nonce region.
    pub fn nonce(&self) -> &[u8] {
        &self.raw[NONCE_START..NONCE_END]
    }

    /// Mutable nonce region.
    pub fn nonce_mut(&mut self) -> &mut [u8] {
        &mut self.raw[NONCE_START..NONCE_END]
    }

    /// The packet body, excluding header and tag. Valid only while the
    /// payload holds a sealed datagram of at least `HEADER_SIZE + FOOTER_SIZE`
    /// bytes or an unsealed body.
    pub fn packet(&self) -> &[u8] {
        &self.raw[PACKET_START..self.length.min(self.raw.len())]
    }

    /// The packet body of a sealed datagram, tag excluded.
    pub fn sealed_body(&self) -> &[u8] {
        &self.raw[PACKET_START..self.length - TAG_LENGTH]
    }

    /// Mutable body region of `len` bytes starting at `PACKET_START`.
    pub fn body_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.raw[PACKET_START..PACKET_START + len]
    }

    /// The authentication tag region of a sealed datagram.
    pub fn tag(&self) -> &[u8] {
        &self.raw[self.length - TAG_LENGTH..self.length]
    }

    /// Mutable access to the raw backing buffer.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.raw
    }

    /// Number of body bytes currently held (header excluded, tag excluded
    /// when the payload is unsealed).
    pub fn body_len(&self) -> usize {
        self.length - HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_do_not_overlap() {
        assert_eq!(IP_END, NONCE_START);
        assert_eq!(NONCE_END, PACKET_START);
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(FOOTER_SIZE, 16);
        assert_eq!(MTU, 65_468);
    }

    #[test]
    fn test_tunnel_payload_lengths() {
        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        let payload = Payload::from_tunnel(&mut buf, 100);
        assert_eq!(payload.length(), HEADER_SIZE + 100);
        assert_eq!(payload.body_len(), 100);
        assert_eq!(payload.packet().len(), 100);
    }

    #[test]
    fn test_socket_payload_regions() {
        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        buf[IP_START..IP_END].copy_from_slice(&[10, 10, 0, 2]);
        for (i, b) in buf[NONCE_START..NONCE_END].iter_mut().enumerate() {
            *b = i as u8;
        }
        let n = HEADER_SIZE + 64 + TAG_LENGTH;
        let payload = Payload::from_socket(&mut buf, n);
        assert_eq!(payload.peer_ip(), &[10, 10, 0, 2]);
        assert_eq!(payload.nonce().len(), NONCE_LENGTH);
        assert_eq!(payload.sealed_body().len(), 64);
        assert_eq!(payload.tag().len(), TAG_LENGTH);
    }

    #[test]
    fn test_header_write_does_not_touch_body() {
        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        buf[PACKET_START] = 0xAA;
        let mut payload = Payload::from_tunnel(&mut buf, 1);
        payload.peer_ip_mut().copy_from_slice(&[1, 2, 3, 4]);
        payload.nonce_mut().fill(0xFF);
        assert_eq!(payload.packet()[0], 0xAA);
    }
}

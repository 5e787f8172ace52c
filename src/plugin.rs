//! In-flight payload transforms, ordered and reversible.
//!
//! Plugins run between routing and sealing on the way out, and between
//! opening and the tunnel write on the way in. The outgoing worker applies
//! them in ascending order, the incoming worker in descending order, so a
//! chain always unwinds in reverse.
//!
//! A plugin only touches packets for peers that advertise it: an asymmetric
//! capability set bypasses the plugin in both directions, so the sender
//! never emits a transform the receiver would not understand.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::payload::{Payload, HEADER_SIZE, MTU};

/// Which way the packet is travelling through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A reversible payload transform.
pub trait Plugin: Send + Sync {
    /// Stable name, matched against a peer's advertised capability set
    fn name(&self) -> &'static str;

    /// Position in the chain's total order
    fn order(&self) -> i32;

    /// Transform the payload in the given direction. Returning `false`
    /// drops the packet; the payload is left in an unspecified state.
    fn apply(&self, direction: Direction, payload: &mut Payload, mapping: &Mapping) -> bool;

    /// Release any resources held by the plugin
    fn close(&self) -> Result<()>;
}

/// Name of the Snappy compression plugin
pub const COMPRESSION: &str = "compression";

const COMPRESSION_ORDER: i32 = 10;

/// Build the configured plugin chain, sorted ascending by order.
pub fn build(names: &[String]) -> Result<Vec<Arc<dyn Plugin>>> {
    let mut chain: Vec<Arc<dyn Plugin>> = Vec::with_capacity(names.len());
    for name in names {
        match name.as_str() {
            COMPRESSION => chain.push(Arc::new(Compression)),
            other => return Err(Error::UnknownPlugin(other.to_string())),
        }
    }
    chain.sort_by_key(|p| p.order());
    Ok(chain)
}

/// Snappy body compression.
pub struct Compression;

impl Plugin for Compression {
    fn name(&self) -> &'static str {
        COMPRESSION
    }

    fn order(&self) -> i32 {
        COMPRESSION_ORDER
    }

    fn apply(&self, direction: Direction, payload: &mut Payload, mapping: &Mapping) -> bool {
        if !mapping.supported_plugins.contains(COMPRESSION) {
            return true;
        }

        match direction {
            Direction::Outgoing => {
                let compressed = match snap::raw::Encoder::new().compress_vec(payload.packet()) {
                    Ok(buf) => buf,
                    Err(e) => {
                        debug!("Compression failed: {}", e);
                        return false;
                    }
                };
                // Incompressible bodies near the MTU can grow past the
                // region the tag has to follow into.
                if compressed.len() > MTU {
                    debug!(
                        "Compressed body {} exceeds MTU, dropping",
                        compressed.len()
                    );
                    return false;
                }
                payload.body_mut(compressed.len()).copy_from_slice(&compressed);
                payload.set_length(HEADER_SIZE + compressed.len());
                true
            }
            Direction::Incoming => {
                let decompressed = match snap::raw::Decoder::new().decompress_vec(payload.packet())
                {
                    Ok(buf) => buf,
                    Err(e) => {
                        debug!("Decompression failed: {}", e);
                        return false;
                    }
                };
                if decompressed.len() > MTU {
                    return false;
                }
                payload
                    .body_mut(decompressed.len())
                    .copy_from_slice(&decompressed);
                payload.set_length(HEADER_SIZE + decompressed.len());
                true
            }
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::mapping::MappingRecord;
    use crate::payload::MAX_PACKET_LENGTH;

    fn mapping_with_plugins(plugins: Vec<String>) -> Mapping {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let record = MappingRecord {
            private_ip: "10.10.0.2".parse().unwrap(),
            public_key: peer.public_key_base64(),
            ipv4: Some("203.0.113.1".parse().unwrap()),
            ipv6: None,
            port: 1099,
            machine_id: "aa".into(),
            gateway: false,
            plugins,
            expires_at: 0,
        };
        Mapping::from_record(&record, &local.secret).unwrap()
    }

    fn tunnel_payload<'a>(buf: &'a mut [u8], body: &[u8]) -> Payload<'a> {
        buf[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);
        Payload::from_tunnel(buf, body.len())
    }

    #[test]
    fn test_compression_round_trip() {
        let mapping = mapping_with_plugins(vec![COMPRESSION.into()]);
        let plugin = Compression;
        let body: Vec<u8> = std::iter::repeat(*b"abcdefgh")
            .take(180)
            .flatten()
            .collect();

        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        let mut payload = tunnel_payload(&mut buf, &body);

        assert!(plugin.apply(Direction::Outgoing, &mut payload, &mapping));
        assert!(payload.body_len() < body.len(), "repetitive body must shrink");

        assert!(plugin.apply(Direction::Incoming, &mut payload, &mapping));
        assert_eq!(payload.packet(), &body[..]);
    }

    #[test]
    fn test_unsupported_peer_bypassed_both_directions() {
        let mapping = mapping_with_plugins(Vec::new());
        let plugin = Compression;
        let body = b"not going to be touched".to_vec();

        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        let mut payload = tunnel_payload(&mut buf, &body);

        assert!(plugin.apply(Direction::Outgoing, &mut payload, &mapping));
        assert_eq!(payload.packet(), &body[..]);

        assert!(plugin.apply(Direction::Incoming, &mut payload, &mapping));
        assert_eq!(payload.packet(), &body[..]);
    }

    #[test]
    fn test_corrupt_stream_drops_packet() {
        let mapping = mapping_with_plugins(vec![COMPRESSION.into()]);
        let plugin = Compression;

        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        let mut payload = tunnel_payload(&mut buf, &[0xFF; 64]);
        assert!(!plugin.apply(Direction::Incoming, &mut payload, &mapping));
    }

    #[test]
    fn test_build_rejects_unknown_names() {
        assert!(build(&["compression".into()]).is_ok());
        match build(&["exfiltrate".into()]) {
            Err(Error::UnknownPlugin(name)) => assert_eq!(name, "exfiltrate"),
            other => panic!("expected UnknownPlugin, got {:?}", other.map(|_| ())),
        }
    }
}

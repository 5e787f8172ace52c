//! Peer mapping records and their derived, owned form.
//!
//! A [`MappingRecord`] is what nodes publish into the control-plane store:
//! private address, public key, public endpoints, capabilities, and the
//! lease expiration used for stale-entry tie-breaks. A [`Mapping`] is the
//! immutable in-memory value built from a record plus the local private key:
//! session AEAD and kernel-level endpoint address are derived on ingestion
//! and never mutated afterwards.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{self, SessionAead};
use crate::error::{Error, Result};

/// The stored representation of a peer, as published under
/// `{prefix}/nodes/{machine_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// The peer's address inside the overlay subnet
    pub private_ip: Ipv4Addr,

    /// The peer's X25519 public key, base64 encoded
    pub public_key: String,

    /// Public IPv4 endpoint of the peer's UDP listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,

    /// Public IPv6 endpoint of the peer's UDP listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,

    /// UDP listen port shared by both endpoints
    pub port: u16,

    /// Owning node's machine id (hex)
    pub machine_id: String,

    /// Whether this peer forwards traffic destined outside the overlay
    #[serde(default)]
    pub gateway: bool,

    /// Plugin names this peer will accept
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Lease expiration, seconds since the unix epoch
    pub expires_at: u64,
}

impl MappingRecord {
    /// Serialize to the store's JSON form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the store's JSON form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A fully derived peer identity. Constructed once per reconcile, shared
/// read-only across all worker queues.
pub struct Mapping {
    /// The peer's address inside the overlay subnet
    pub private_ip: Ipv4Addr,
    /// The peer's X25519 public key
    pub public_key: PublicKey,
    /// Resolved datagram address of the chosen public endpoint
    pub sockaddr: SocketAddr,
    /// Whether this peer is the designated default route
    pub gateway: bool,
    /// Owning node's machine id
    pub machine_id: String,
    /// Lease expiration, seconds since the unix epoch
    pub expires_at: u64,
    /// Plugin names the peer will accept
    pub supported_plugins: HashSet<String>,
    /// AES-128-GCM state keyed by the first half of the X25519 shared secret
    pub aead: SessionAead,
}

impl Mapping {
    /// Build a derived mapping from a stored record and the local private key.
    ///
    /// Endpoint preference is IPv4, falling back to IPv6; a record with
    /// neither is rejected.
    pub fn from_record(record: &MappingRecord, local_secret: &StaticSecret) -> Result<Self> {
        let public_key = crypto::parse_public_key(&record.public_key)?;
        let shared = crypto::shared_secret(&public_key, local_secret);

        let addr: IpAddr = match (record.ipv4, record.ipv6) {
            (Some(v4), _) => IpAddr::V4(v4),
            (None, Some(v6)) => IpAddr::V6(v6),
            (None, None) => {
                return Err(Error::Store(format!(
                    "mapping for {} has no public endpoint",
                    record.private_ip
                )))
            }
        };

        Ok(Self {
            private_ip: record.private_ip,
            public_key,
            sockaddr: SocketAddr::new(addr, record.port),
            gateway: record.gateway,
            machine_id: record.machine_id.clone(),
            expires_at: record.expires_at,
            supported_plugins: record.plugins.iter().cloned().collect(),
            aead: SessionAead::new(&shared),
        })
    }

    /// Routing-table key: the private address as a big-endian integer.
    pub fn key(&self) -> u32 {
        u32::from_be_bytes(self.private_ip.octets())
    }

    /// Stale-entry tie-break: the mapping with the later lease expiration
    /// wins; on equal expirations the lexicographically larger machine id
    /// wins.
    pub fn supersedes(&self, other: &Mapping) -> bool {
        match self.expires_at.cmp(&other.expires_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.machine_id > other.machine_id,
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("private_ip", &self.private_ip)
            .field("public_key", &BASE64.encode(self.public_key.as_bytes()))
            .field("sockaddr", &self.sockaddr)
            .field("gateway", &self.gateway)
            .field("machine_id", &self.machine_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    pub(crate) fn test_record(private_ip: &str, kp: &KeyPair) -> MappingRecord {
        MappingRecord {
            private_ip: private_ip.parse().unwrap(),
            public_key: kp.public_key_base64(),
            ipv4: Some("203.0.113.10".parse().unwrap()),
            ipv6: None,
            port: 1099,
            machine_id: "aabbccdd".into(),
            gateway: false,
            plugins: vec!["compression".into()],
            expires_at: 1_900_000_000,
        }
    }

    #[test]
    fn test_record_json_round_trip() {
        let kp = KeyPair::generate();
        let record = test_record("10.10.0.5", &kp);
        let parsed = MappingRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn test_derived_fields_recompute_equal() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let record = test_record("10.10.0.5", &peer);

        let a = Mapping::from_record(&record, &local.secret).unwrap();
        let b = Mapping::from_record(&record, &local.secret).unwrap();
        assert_eq!(a.sockaddr, b.sockaddr);
        assert_eq!(a.key(), b.key());

        // Equal derivations must interoperate at the AEAD level.
        let mut nonce = [0u8; crate::payload::NONCE_LENGTH];
        crypto::fill_nonce(&mut nonce);
        let mut buf = *b"derive me twice";
        let tag = a.aead.seal_in_place(&nonce, &mut buf).unwrap();
        b.aead.open_in_place(&nonce, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"derive me twice");
    }

    #[test]
    fn test_endpoint_preference_and_rejection() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let mut record = test_record("10.10.0.6", &peer);
        record.ipv6 = Some("2001:db8::1".parse().unwrap());

        let mapping = Mapping::from_record(&record, &local.secret).unwrap();
        assert!(mapping.sockaddr.is_ipv4());

        record.ipv4 = None;
        let mapping = Mapping::from_record(&record, &local.secret).unwrap();
        assert!(mapping.sockaddr.is_ipv6());

        record.ipv6 = None;
        assert!(Mapping::from_record(&record, &local.secret).is_err());
    }

    #[test]
    fn test_supersedes_tie_break() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let record = test_record("10.10.0.7", &peer);

        let mut newer = record.clone();
        newer.expires_at += 60;
        let older = Mapping::from_record(&record, &local.secret).unwrap();
        let newer = Mapping::from_record(&newer, &local.secret).unwrap();
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));

        let mut bigger_id = record.clone();
        bigger_id.machine_id = "ffeeddcc".into();
        let bigger_id = Mapping::from_record(&bigger_id, &local.secret).unwrap();
        assert!(bigger_id.supersedes(&older));
        assert!(!older.supersedes(&bigger_id));
    }
}

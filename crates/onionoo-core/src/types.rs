//! Core data types for Onionoo.
//!
//! This module defines the per-node summary record the index is built from.
//! Records are supplied by a [`SummarySource`](crate::source::SummarySource)
//! and are:
//!
//! - **Serializable**: sources may hand them over as JSON
//! - **Self-validating**: `init_cache` rejects records that break local invariants
//! - **Search-ready**: derived identifiers are computed once per build, not per request

use crate::error::{OnionooError, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;

/// Nickname reported for nodes that did not choose one.
pub const UNNAMED: &str = "Unnamed";

/// Whether a node is a public relay or a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Relay,
    Bridge,
}

impl NodeKind {
    pub fn is_relay(&self) -> bool {
        matches!(self, NodeKind::Relay)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Relay => write!(f, "relay"),
            NodeKind::Bridge => write!(f, "bridge"),
        }
    }
}

/// Returns true if `s` is exactly 40 hexadecimal characters.
pub fn is_hex_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Upper-case hex SHA-1 of the binary form of a hex fingerprint.
///
/// Relays are addressable by this form; a bridge's published fingerprint is
/// already this form of its secret fingerprint.
pub fn hash_fingerprint(fingerprint: &str) -> Option<String> {
    let bytes = hex::decode(fingerprint).ok()?;
    Some(hex::encode_upper(Sha1::digest(&bytes)))
}

/// Unpadded standard base64 of the binary form of a hex fingerprint.
pub fn base64_fingerprint(fingerprint: &str) -> Option<String> {
    let bytes = hex::decode(fingerprint).ok()?;
    Some(base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes))
}

/// The ten 4-character blocks of a fingerprint, sorted for binary search.
pub fn sorted_hex_blocks(fingerprint: &str) -> Vec<String> {
    let mut blocks: Vec<String> = fingerprint
        .as_bytes()
        .chunks(4)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .map(str::to_string)
        .collect();
    blocks.sort();
    blocks
}

/// One node's current queryable attributes.
///
/// For relays `fingerprint` is the relay's identity fingerprint; for bridges
/// it is the already-hashed fingerprint, so bridges are never addressable by
/// their secret identity.
///
/// ## Design Notes
///
/// - Fields marked `#[serde(skip)]` are derived by `init_cache`, which the
///   index builder calls once per record per build
/// - Equality and hashing use `(kind, fingerprint)` only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Relay or bridge
    #[serde(default)]
    pub kind: NodeKind,

    /// 40 upper-case hex characters
    pub fingerprint: String,

    /// Chosen nickname, if any
    #[serde(default)]
    pub nickname: Option<String>,

    /// OR and exit addresses; IPv6 addresses in brackets
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Whether the node was running in the last consensus or bridge status
    #[serde(default)]
    pub running: bool,

    /// Lower-case two-letter country code
    #[serde(default)]
    pub country_code: Option<String>,

    /// Autonomous system number, e.g. "AS3320"
    #[serde(default)]
    pub as_number: Option<String>,

    /// Autonomous system name, e.g. "Deutsche Telekom AG"
    #[serde(default)]
    pub as_name: Option<String>,

    /// Directory authority flags as reported
    #[serde(default)]
    pub flags: BTreeSet<String>,

    /// Consensus weight (always zero for bridges)
    #[serde(default)]
    pub consensus_weight: u64,

    /// When this node was first seen in the network
    pub first_seen: DateTime<Utc>,

    /// When this node was last seen in the network
    pub last_seen: DateTime<Utc>,

    /// Operator contact line
    #[serde(default)]
    pub contact: Option<String>,

    /// Family members this node declares, as fingerprints
    #[serde(default)]
    pub family: BTreeSet<String>,

    /// Tor software version, e.g. "0.4.8.9"
    #[serde(default)]
    pub version: Option<String>,

    /// Operating system as reported in the platform line
    #[serde(default)]
    pub operating_system: Option<String>,

    /// Host names whose forward lookup confirmed the address
    #[serde(default)]
    pub verified_host_names: BTreeSet<String>,

    /// Host names found by reverse lookup only
    #[serde(default)]
    pub unverified_host_names: BTreeSet<String>,

    /// Whether the version is recommended by the directory authorities
    #[serde(default)]
    pub recommended_version: Option<bool>,

    #[serde(skip)]
    hashed_fingerprint: String,

    #[serde(skip)]
    base64_fingerprint: Option<String>,

    #[serde(skip)]
    hex_blocks: Vec<String>,

    #[serde(skip)]
    nickname_lower: String,
}

impl SummaryRecord {
    /// Create a relay record with the given fingerprint.
    pub fn relay(fingerprint: impl Into<String>) -> Self {
        Self::new(NodeKind::Relay, fingerprint.into())
    }

    /// Create a bridge record with the given (hashed) fingerprint.
    pub fn bridge(hashed_fingerprint: impl Into<String>) -> Self {
        Self::new(NodeKind::Bridge, hashed_fingerprint.into())
    }

    fn new(kind: NodeKind, fingerprint: String) -> Self {
        SummaryRecord {
            kind,
            fingerprint,
            nickname: None,
            addresses: Vec::new(),
            running: false,
            country_code: None,
            as_number: None,
            as_name: None,
            flags: BTreeSet::new(),
            consensus_weight: 0,
            first_seen: DateTime::<Utc>::default(),
            last_seen: DateTime::<Utc>::default(),
            contact: None,
            family: BTreeSet::new(),
            version: None,
            operating_system: None,
            verified_host_names: BTreeSet::new(),
            unverified_host_names: BTreeSet::new(),
            recommended_version: None,
            hashed_fingerprint: String::new(),
            base64_fingerprint: None,
            hex_blocks: Vec::new(),
            nickname_lower: String::new(),
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    pub fn with_country(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }

    pub fn with_as_number(mut self, as_number: impl Into<String>) -> Self {
        self.as_number = Some(as_number.into());
        self
    }

    pub fn with_as_name(mut self, as_name: impl Into<String>) -> Self {
        self.as_name = Some(as_name.into());
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_consensus_weight(mut self, consensus_weight: u64) -> Self {
        self.consensus_weight = consensus_weight;
        self
    }

    pub fn with_first_seen(mut self, first_seen: DateTime<Utc>) -> Self {
        self.first_seen = first_seen;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_family<I, S>(mut self, family: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.family = family.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_operating_system(mut self, operating_system: impl Into<String>) -> Self {
        self.operating_system = Some(operating_system.into());
        self
    }

    pub fn with_host_names<I, J, S>(mut self, verified: I, unverified: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verified_host_names = verified.into_iter().map(Into::into).collect();
        self.unverified_host_names = unverified.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recommended_version(mut self, recommended: bool) -> Self {
        self.recommended_version = Some(recommended);
        self
    }

    pub fn is_relay(&self) -> bool {
        self.kind.is_relay()
    }

    /// Nickname, or "Unnamed" if none was chosen
    pub fn nickname(&self) -> &str {
        self.nickname.as_deref().unwrap_or(UNNAMED)
    }

    /// Lower-case nickname, populated by `init_cache`
    pub fn nickname_lower(&self) -> &str {
        &self.nickname_lower
    }

    /// Hashed fingerprint, populated by `init_cache`
    pub fn hashed_fingerprint(&self) -> &str {
        &self.hashed_fingerprint
    }

    /// Base64 fingerprint (relays only), populated by `init_cache`
    pub fn base64_fingerprint(&self) -> Option<&str> {
        self.base64_fingerprint.as_deref()
    }

    /// Sorted 4-hex blocks of the fingerprint, populated by `init_cache`
    pub fn sorted_hex_blocks(&self) -> &[String] {
        &self.hex_blocks
    }

    /// Verified and unverified host names together
    pub fn host_names(&self) -> impl Iterator<Item = &String> {
        self.verified_host_names
            .iter()
            .chain(self.unverified_host_names.iter())
    }

    /// Normalize the record and compute derived identifiers.
    ///
    /// Fails if the fingerprint is not 40 hex characters or an address does
    /// not parse; the index builder skips such records.
    pub fn init_cache(&mut self) -> Result<()> {
        if !is_hex_fingerprint(&self.fingerprint) {
            return Err(OnionooError::invalid_record(
                &self.fingerprint,
                "fingerprint is not 40 hex characters",
            ));
        }
        self.fingerprint.make_ascii_uppercase();

        for address in &mut self.addresses {
            address.make_ascii_lowercase();
            let bare = address.trim_start_matches('[').trim_end_matches(']');
            if bare.parse::<IpAddr>().is_err() {
                return Err(OnionooError::invalid_record(
                    &self.fingerprint,
                    format!("malformed address '{}'", address),
                ));
            }
        }

        if self.nickname.as_deref() == Some(UNNAMED) {
            self.nickname = None;
        }
        if self.contact.as_deref() == Some("") {
            self.contact = None;
        }

        self.family = self
            .family
            .iter()
            .map(|member| member.trim_start_matches('$').to_ascii_uppercase())
            .collect();

        self.hashed_fingerprint = hash_fingerprint(&self.fingerprint)
            .ok_or_else(|| OnionooError::invalid_record(&self.fingerprint, "undecodable hex"))?;
        self.base64_fingerprint = if self.is_relay() {
            base64_fingerprint(&self.fingerprint)
        } else {
            None
        };
        self.hex_blocks = sorted_hex_blocks(&self.fingerprint);
        self.nickname_lower = self.nickname().to_lowercase();
        Ok(())
    }
}

impl PartialEq for SummaryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.fingerprint == other.fingerprint
    }
}

impl Eq for SummaryRecord {}

impl Hash for SummaryRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.fingerprint.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "000C5F55BD4814B917CC474BD537F1A3B33CCE2A";

    #[test]
    fn test_hash_fingerprint() {
        let hashed = hash_fingerprint(FP).unwrap();
        assert_eq!(hashed.len(), 40);
        assert!(is_hex_fingerprint(&hashed));
        assert_eq!(hashed, hashed.to_uppercase());
        assert_ne!(hashed, FP);
        assert!(hash_fingerprint("not hex").is_none());
    }

    #[test]
    fn test_base64_fingerprint() {
        let encoded = base64_fingerprint(FP).unwrap();
        assert_eq!(encoded.len(), 27);
        assert!(!encoded.contains('='));
        assert!(encoded.starts_with("AAxfVb1IFLkXzEdL1Tfx"));
    }

    #[test]
    fn test_sorted_hex_blocks() {
        let blocks = sorted_hex_blocks(FP);
        assert_eq!(blocks.len(), 10);
        assert_eq!(blocks[0], "000C");
        assert!(blocks.binary_search(&"CE2A".to_string()).is_ok());
        assert!(blocks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_init_cache_normalizes() {
        let mut record = SummaryRecord::relay(FP.to_lowercase())
            .with_nickname("Unnamed")
            .with_addresses(["[2001:DB8::1]", "192.0.2.1"])
            .with_contact("")
            .with_family(["$0011BD2485AD45D984EC4159C88FC066E5E3300E"]);
        record.init_cache().unwrap();

        assert_eq!(record.fingerprint, FP);
        assert_eq!(record.nickname, None);
        assert_eq!(record.nickname(), "Unnamed");
        assert_eq!(record.nickname_lower(), "unnamed");
        assert_eq!(record.contact, None);
        assert_eq!(record.addresses[0], "[2001:db8::1]");
        assert!(record
            .family
            .contains("0011BD2485AD45D984EC4159C88FC066E5E3300E"));
        assert!(record.base64_fingerprint().is_some());
        assert_eq!(record.hashed_fingerprint(), hash_fingerprint(FP).unwrap());
    }

    #[test]
    fn test_init_cache_bridge_has_no_base64() {
        let mut record = SummaryRecord::bridge(FP);
        record.init_cache().unwrap();
        assert!(record.base64_fingerprint().is_none());
        assert!(!record.hashed_fingerprint().is_empty());
    }

    #[test]
    fn test_init_cache_rejects_bad_records() {
        let mut record = SummaryRecord::relay("ABCD");
        assert!(record.init_cache().is_err());

        let mut record = SummaryRecord::relay(FP).with_addresses(["300.1.2.3"]);
        let err = record.init_cache().unwrap_err();
        assert!(matches!(err, OnionooError::InvalidRecord { .. }));
    }

    #[test]
    fn test_record_identity() {
        let a = SummaryRecord::relay(FP).with_consensus_weight(1);
        let b = SummaryRecord::relay(FP).with_consensus_weight(2);
        let c = SummaryRecord::bridge(FP);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_record_json_roundtrip_defaults() {
        let json = r#"{
            "kind": "relay",
            "fingerprint": "000C5F55BD4814B917CC474BD537F1A3B33CCE2A",
            "first_seen": "2013-04-16T18:00:00Z",
            "last_seen": "2013-04-24T12:00:00Z"
        }"#;
        let record: SummaryRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_relay());
        assert!(record.flags.is_empty());
        assert_eq!(record.consensus_weight, 0);
        assert_eq!(record.recommended_version, None);
    }
}

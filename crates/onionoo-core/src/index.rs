//! Immutable node index snapshots.
//!
//! A [`NodeIndex`] holds everything a request needs to filter nodes without
//! touching the summary source: primary maps from fingerprint to record, the
//! default relay ordering, and one secondary index per filterable attribute.
//!
//! ## Architecture
//!
//! Each record is stored once, behind an `Arc`, under its canonical key (the
//! relay fingerprint, or the bridge's hashed fingerprint). A lookup map sends
//! both the canonical key and the hashed form of it to the canonical key, so
//! the same record is reachable by either but counted once.
//!
//! Secondary indices map an attribute value to a set of canonical keys. Every
//! key in a secondary index is present in the primary maps of the same
//! snapshot, and the family index is symmetric.
//!
//! Snapshots are built in one pass by [`build_index`] and never mutated after
//! construction. A newer generation is a new `NodeIndex`; readers holding the
//! previous one keep a consistent view until they drop it.

use crate::types::SummaryRecord;
use crate::version::TorVersion;
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Canonical key of an indexed node.
pub type NodeKey = Arc<str>;

/// Set of canonical keys.
pub type KeySet = HashSet<NodeKey>;

/// Country code under which relays without geo data are indexed.
pub const UNKNOWN_COUNTRY: &str = "xz";

/// AS number under which relays without geo data are indexed.
pub const UNKNOWN_AS: &str = "AS0";

/// Format used for publication timestamps.
pub const PUBLISHED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical `AS<n>` form of an AS number, or `None` if it does not parse.
///
/// Accepts an optional case-insensitive `AS` prefix and strips leading zeros.
pub fn canonical_as_number(raw: &str) -> Option<String> {
    let digits = if raw.len() >= 2 && raw[..2].eq_ignore_ascii_case("as") {
        &raw[2..]
    } else {
        raw
    };
    if digits.is_empty() || digits.len() > 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().map(|n| format!("AS{}", n))
}

/// Whole days between `timestamp` and `now`, truncating. Future timestamps count as day zero.
pub fn days_since(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> u32 {
    let days = (now - timestamp).num_days();
    u32::try_from(days.max(0)).unwrap_or(u32::MAX)
}

/// Summary counts for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Relays indexed
    pub relays: usize,

    /// Bridges indexed
    pub bridges: usize,

    /// Records rejected by validation
    pub skipped_invalid: usize,

    /// Records dropped for not being seen recently enough
    pub skipped_stale: usize,

    /// Distinct country codes among relays
    pub countries: usize,

    /// Distinct AS numbers among relays
    pub autonomous_systems: usize,

    /// Distinct flags among relays and bridges
    pub flags: usize,

    /// Relays with at least one mutual family member
    pub relays_with_family: usize,
}

/// One immutable generation of the node index.
#[derive(Debug)]
pub struct NodeIndex {
    generation: DateTime<Utc>,
    built_at: DateTime<Utc>,

    relays: HashMap<NodeKey, Arc<SummaryRecord>>,
    bridges: HashMap<NodeKey, Arc<SummaryRecord>>,

    /// Fingerprint and hashed fingerprint to canonical relay key
    relay_lookup: HashMap<String, NodeKey>,

    /// Hashed and double-hashed fingerprint to canonical bridge key
    bridge_lookup: HashMap<String, NodeKey>,

    /// Relay keys by (consensus weight, fingerprint) ascending
    relay_order: Vec<NodeKey>,

    /// Bridge keys by fingerprint ascending
    bridge_order: Vec<NodeKey>,

    relays_by_country: HashMap<String, KeySet>,
    relays_by_as: HashMap<String, KeySet>,
    relays_by_as_name: HashMap<String, KeySet>,
    relays_by_flag: HashMap<String, KeySet>,
    bridges_by_flag: HashMap<String, KeySet>,
    relays_by_contact: HashMap<String, KeySet>,
    relays_by_family: HashMap<NodeKey, KeySet>,
    relays_by_first_seen_days: BTreeMap<u32, KeySet>,
    bridges_by_first_seen_days: BTreeMap<u32, KeySet>,
    relays_by_last_seen_days: BTreeMap<u32, KeySet>,
    bridges_by_last_seen_days: BTreeMap<u32, KeySet>,
    relays_by_version: HashMap<TorVersion, KeySet>,
    bridges_by_version: HashMap<TorVersion, KeySet>,
    relays_by_os: HashMap<String, KeySet>,
    bridges_by_os: HashMap<String, KeySet>,
    relays_by_host_name: HashMap<String, KeySet>,
    relays_by_recommended_version: HashMap<bool, KeySet>,
    bridges_by_recommended_version: HashMap<bool, KeySet>,

    relays_published: Option<DateTime<Utc>>,
    bridges_published: Option<DateTime<Utc>>,

    stats: IndexStats,
}

impl NodeIndex {
    /// Generation marker of the source data this snapshot was built from
    pub fn generation(&self) -> DateTime<Utc> {
        self.generation
    }

    /// The "now" day buckets were computed against
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn relays(&self) -> &HashMap<NodeKey, Arc<SummaryRecord>> {
        &self.relays
    }

    pub fn bridges(&self) -> &HashMap<NodeKey, Arc<SummaryRecord>> {
        &self.bridges
    }

    /// Canonical relay key for a fingerprint or hashed fingerprint.
    pub fn relay_key(&self, fingerprint: &str) -> Option<&NodeKey> {
        self.relay_lookup.get(fingerprint)
    }

    /// Canonical bridge key for a hashed or double-hashed fingerprint.
    pub fn bridge_key(&self, fingerprint: &str) -> Option<&NodeKey> {
        self.bridge_lookup.get(fingerprint)
    }

    pub fn relay_order(&self) -> &[NodeKey] {
        &self.relay_order
    }

    pub fn bridge_order(&self) -> &[NodeKey] {
        &self.bridge_order
    }

    pub fn relays_by_country(&self, country: &str) -> Option<&KeySet> {
        self.relays_by_country.get(country)
    }

    pub fn relays_by_as(&self, as_number: &str) -> Option<&KeySet> {
        self.relays_by_as.get(as_number)
    }

    /// Lower-cased AS names with the relays announced from them
    pub fn relays_by_as_name(&self) -> &HashMap<String, KeySet> {
        &self.relays_by_as_name
    }

    pub fn relays_by_flag(&self, flag: &str) -> Option<&KeySet> {
        self.relays_by_flag.get(flag)
    }

    pub fn bridges_by_flag(&self, flag: &str) -> Option<&KeySet> {
        self.bridges_by_flag.get(flag)
    }

    /// Lower-cased contact strings with the relays that carry them
    pub fn relays_by_contact(&self) -> &HashMap<String, KeySet> {
        &self.relays_by_contact
    }

    /// Mutual family members of a relay
    pub fn relay_family(&self, key: &str) -> Option<&KeySet> {
        self.relays_by_family.get(key)
    }

    pub fn relays_by_first_seen_days(&self) -> &BTreeMap<u32, KeySet> {
        &self.relays_by_first_seen_days
    }

    pub fn bridges_by_first_seen_days(&self) -> &BTreeMap<u32, KeySet> {
        &self.bridges_by_first_seen_days
    }

    pub fn relays_by_last_seen_days(&self) -> &BTreeMap<u32, KeySet> {
        &self.relays_by_last_seen_days
    }

    pub fn bridges_by_last_seen_days(&self) -> &BTreeMap<u32, KeySet> {
        &self.bridges_by_last_seen_days
    }

    pub fn relays_by_version(&self) -> &HashMap<TorVersion, KeySet> {
        &self.relays_by_version
    }

    pub fn bridges_by_version(&self) -> &HashMap<TorVersion, KeySet> {
        &self.bridges_by_version
    }

    /// Lower-cased operating systems with the relays that run them
    pub fn relays_by_os(&self) -> &HashMap<String, KeySet> {
        &self.relays_by_os
    }

    pub fn bridges_by_os(&self) -> &HashMap<String, KeySet> {
        &self.bridges_by_os
    }

    /// Lower-cased host names with the relays that resolve to them
    pub fn relays_by_host_name(&self) -> &HashMap<String, KeySet> {
        &self.relays_by_host_name
    }

    pub fn relays_by_recommended_version(&self, recommended: bool) -> Option<&KeySet> {
        self.relays_by_recommended_version.get(&recommended)
    }

    pub fn bridges_by_recommended_version(&self, recommended: bool) -> Option<&KeySet> {
        self.bridges_by_recommended_version.get(&recommended)
    }

    /// Latest last-seen time among indexed relays
    pub fn relays_published(&self) -> Option<DateTime<Utc>> {
        self.relays_published
    }

    /// Latest last-seen time among indexed bridges
    pub fn bridges_published(&self) -> Option<DateTime<Utc>> {
        self.bridges_published
    }

    /// Count records the source failed to deliver as skipped.
    pub(crate) fn add_skipped_invalid(&mut self, count: usize) {
        self.stats.skipped_invalid += count;
    }

    /// Relay publication time as `YYYY-MM-DD HH:MM:SS`
    pub fn relays_published_string(&self) -> Option<String> {
        self.relays_published
            .map(|t| t.format(PUBLISHED_FORMAT).to_string())
    }

    /// Bridge publication time as `YYYY-MM-DD HH:MM:SS`
    pub fn bridges_published_string(&self) -> Option<String> {
        self.bridges_published
            .map(|t| t.format(PUBLISHED_FORMAT).to_string())
    }
}

fn insert_key<K: std::hash::Hash + Eq>(map: &mut HashMap<K, KeySet>, value: K, key: &NodeKey) {
    map.entry(value).or_default().insert(Arc::clone(key));
}

fn insert_day(map: &mut BTreeMap<u32, KeySet>, day: u32, key: &NodeKey) {
    map.entry(day).or_default().insert(Arc::clone(key));
}

/// Build a complete snapshot from the current source records.
///
/// Records that fail validation are logged and skipped. Records last seen
/// more than `max_record_age` before the newest last-seen time in the batch
/// are dropped, so a stalled upstream still yields its most recent nodes.
/// Neither aborts the build, so the result may be partial or empty. `now` only
/// anchors the day buckets.
#[instrument(skip(records), fields(records = records.len()))]
pub fn build_index(
    mut records: Vec<SummaryRecord>,
    generation: DateTime<Utc>,
    now: DateTime<Utc>,
    max_record_age: Duration,
) -> NodeIndex {
    let validated: Vec<_> = records
        .par_iter_mut()
        .map(|record| record.init_cache())
        .collect();

    let mut stats = IndexStats::default();
    let newest = records
        .iter()
        .zip(&validated)
        .filter(|(_, outcome)| outcome.is_ok())
        .map(|(record, _)| record.last_seen)
        .max();
    let cutoff = newest.map(|newest| newest - max_record_age);
    let mut relays: HashMap<NodeKey, Arc<SummaryRecord>> = HashMap::new();
    let mut bridges: HashMap<NodeKey, Arc<SummaryRecord>> = HashMap::new();

    for (record, outcome) in records.into_iter().zip(validated) {
        if let Err(e) = outcome {
            warn!(error = %e, "Skipping summary record");
            stats.skipped_invalid += 1;
            continue;
        }
        if cutoff.map_or(false, |cutoff| record.last_seen < cutoff) {
            stats.skipped_stale += 1;
            continue;
        }
        let key: NodeKey = Arc::from(record.fingerprint.as_str());
        let target = if record.is_relay() {
            &mut relays
        } else {
            &mut bridges
        };
        if target.contains_key(&key) {
            warn!(fingerprint = %key, kind = %record.kind, "Skipping duplicate summary record");
            stats.skipped_invalid += 1;
            continue;
        }
        target.insert(key, Arc::new(record));
    }
    if stats.skipped_stale > 0 {
        debug!(count = stats.skipped_stale, "Dropped records not seen recently");
    }

    let mut index = NodeIndex {
        generation,
        built_at: now,
        relays: HashMap::new(),
        bridges: HashMap::new(),
        relay_lookup: HashMap::with_capacity(relays.len() * 2),
        bridge_lookup: HashMap::with_capacity(bridges.len() * 2),
        relay_order: Vec::with_capacity(relays.len()),
        bridge_order: Vec::with_capacity(bridges.len()),
        relays_by_country: HashMap::new(),
        relays_by_as: HashMap::new(),
        relays_by_as_name: HashMap::new(),
        relays_by_flag: HashMap::new(),
        bridges_by_flag: HashMap::new(),
        relays_by_contact: HashMap::new(),
        relays_by_family: HashMap::new(),
        relays_by_first_seen_days: BTreeMap::new(),
        bridges_by_first_seen_days: BTreeMap::new(),
        relays_by_last_seen_days: BTreeMap::new(),
        bridges_by_last_seen_days: BTreeMap::new(),
        relays_by_version: HashMap::new(),
        bridges_by_version: HashMap::new(),
        relays_by_os: HashMap::new(),
        bridges_by_os: HashMap::new(),
        relays_by_host_name: HashMap::new(),
        relays_by_recommended_version: [(true, KeySet::new()), (false, KeySet::new())]
            .into_iter()
            .collect(),
        bridges_by_recommended_version: [(true, KeySet::new()), (false, KeySet::new())]
            .into_iter()
            .collect(),
        relays_published: None,
        bridges_published: None,
        stats: IndexStats::default(),
    };

    for (key, relay) in &relays {
        index.relay_lookup.insert(key.to_string(), Arc::clone(key));
        index
            .relay_lookup
            .insert(relay.hashed_fingerprint().to_string(), Arc::clone(key));

        let country = relay
            .country_code
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        insert_key(&mut index.relays_by_country, country, key);

        let as_number = relay
            .as_number
            .as_deref()
            .and_then(canonical_as_number)
            .unwrap_or_else(|| UNKNOWN_AS.to_string());
        insert_key(&mut index.relays_by_as, as_number, key);
        if let Some(as_name) = &relay.as_name {
            insert_key(&mut index.relays_by_as_name, as_name.to_lowercase(), key);
        }

        for flag in &relay.flags {
            insert_key(&mut index.relays_by_flag, flag.to_lowercase(), key);
        }
        if let Some(contact) = &relay.contact {
            insert_key(&mut index.relays_by_contact, contact.to_lowercase(), key);
        }
        insert_day(
            &mut index.relays_by_first_seen_days,
            days_since(now, relay.first_seen),
            key,
        );
        insert_day(
            &mut index.relays_by_last_seen_days,
            days_since(now, relay.last_seen),
            key,
        );
        if let Some(version) = relay.version.as_deref().and_then(|v| v.parse().ok()) {
            insert_key(&mut index.relays_by_version, version, key);
        }
        if let Some(os) = &relay.operating_system {
            insert_key(&mut index.relays_by_os, os.to_lowercase(), key);
        }
        for host_name in relay.host_names() {
            insert_key(&mut index.relays_by_host_name, host_name.to_lowercase(), key);
        }
        if let Some(recommended) = relay.recommended_version {
            insert_key(&mut index.relays_by_recommended_version, recommended, key);
        }
        index.relays_published = index.relays_published.max(Some(relay.last_seen));
    }

    // Only edges declared from both ends survive
    for (key, relay) in &relays {
        let mutual: KeySet = relay
            .family
            .iter()
            .filter(|member| member.as_str() != &**key)
            .filter_map(|member| relays.get_key_value(member.as_str()))
            .filter(|(_, other)| other.family.contains(&**key))
            .map(|(member_key, _)| Arc::clone(member_key))
            .collect();
        if !mutual.is_empty() {
            index.relays_by_family.insert(Arc::clone(key), mutual);
        }
    }

    for (key, bridge) in &bridges {
        index.bridge_lookup.insert(key.to_string(), Arc::clone(key));
        index
            .bridge_lookup
            .insert(bridge.hashed_fingerprint().to_string(), Arc::clone(key));

        for flag in &bridge.flags {
            insert_key(&mut index.bridges_by_flag, flag.to_lowercase(), key);
        }
        insert_day(
            &mut index.bridges_by_first_seen_days,
            days_since(now, bridge.first_seen),
            key,
        );
        insert_day(
            &mut index.bridges_by_last_seen_days,
            days_since(now, bridge.last_seen),
            key,
        );
        if let Some(version) = bridge.version.as_deref().and_then(|v| v.parse().ok()) {
            insert_key(&mut index.bridges_by_version, version, key);
        }
        if let Some(os) = &bridge.operating_system {
            insert_key(&mut index.bridges_by_os, os.to_lowercase(), key);
        }
        if let Some(recommended) = bridge.recommended_version {
            insert_key(&mut index.bridges_by_recommended_version, recommended, key);
        }
        index.bridges_published = index.bridges_published.max(Some(bridge.last_seen));
    }

    let mut relay_order: Vec<(u64, NodeKey)> = relays
        .iter()
        .map(|(key, relay)| (relay.consensus_weight, Arc::clone(key)))
        .collect();
    relay_order.par_sort_unstable();
    index.relay_order = relay_order.into_iter().map(|(_, key)| key).collect();

    let mut bridge_order: Vec<NodeKey> = bridges.keys().cloned().collect();
    bridge_order.par_sort_unstable();
    index.bridge_order = bridge_order;

    let mut flags: HashSet<&str> = index.relays_by_flag.keys().map(String::as_str).collect();
    flags.extend(index.bridges_by_flag.keys().map(String::as_str));
    stats.relays = relays.len();
    stats.bridges = bridges.len();
    stats.countries = index.relays_by_country.len();
    stats.autonomous_systems = index.relays_by_as.len();
    stats.flags = flags.len();
    stats.relays_with_family = index.relays_by_family.len();
    index.stats = stats;

    index.relays = relays;
    index.bridges = bridges;

    info!(
        relays = index.stats.relays,
        bridges = index.stats.bridges,
        skipped = index.stats.skipped_invalid,
        stale = index.stats.skipped_stale,
        "Built node index"
    );

    index
}

//! The request pipeline.
//!
//! A [`RequestHandler`] answers one validated query against one snapshot. It
//! holds its own `Arc<NodeIndex>` for the whole request, so a publication that
//! lands mid-request is not observed.
//!
//! ## Stages
//!
//! Two candidate maps (relays, bridges) are seeded from the snapshot's primary
//! maps, keyed by canonical fingerprint, and narrowed by each stage in a fixed
//! order. A stage only ever removes candidates:
//!
//! 1. Resource type
//! 2. Node type
//! 3. Running
//! 4. Search terms
//! 5. Lookup
//! 6. Fingerprint (read from the summary source, not the snapshot)
//! 7. Country
//! 8. AS number
//! 9. Flag
//! 10. First seen / last seen days
//! 11. Contact
//! 12. Family
//! 13. Version, operating system, host name, recommended version
//!
//! Survivors are laid out in the snapshot's default order, sorted by any
//! `order` keys, then paged with `offset` and `limit`, relays before bridges.

use crate::error::Result;
use crate::index::{KeySet, NodeIndex, NodeKey};
use crate::order::Orderer;
use crate::query::{DaysRange, QueryParams, ResourceType};
use crate::source::SummarySource;
use crate::types::SummaryRecord;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

type Candidates = HashMap<NodeKey, Arc<SummaryRecord>>;

/// Ordered, paged query result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub relays: Vec<Arc<SummaryRecord>>,
    pub bridges: Vec<Arc<SummaryRecord>>,

    /// Relays dropped from the front by `offset`
    pub relays_skipped: usize,

    /// Bridges dropped from the front by `offset`
    pub bridges_skipped: usize,

    /// Relays dropped from the back by `limit`
    pub relays_truncated: usize,

    /// Bridges dropped from the back by `limit`
    pub bridges_truncated: usize,
}

impl QueryResult {
    /// Relay and bridge fingerprints in response order.
    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.relays
            .iter()
            .chain(self.bridges.iter())
            .map(|record| record.fingerprint.as_str())
    }

    pub fn len(&self) -> usize {
        self.relays.len() + self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A search term with its case variants computed once.
struct SearchTerm {
    raw: String,
    upper: String,
    lower: String,
    /// Fingerprint prefix after a leading `$`
    dollar: Option<String>,
}

impl SearchTerm {
    fn new(raw: &str) -> Self {
        SearchTerm {
            raw: raw.to_string(),
            upper: raw.to_ascii_uppercase(),
            lower: raw.to_lowercase(),
            dollar: raw.strip_prefix('$').map(str::to_ascii_uppercase),
        }
    }

    fn matches_relay(&self, record: &SummaryRecord) -> bool {
        if let Some(prefix) = &self.dollar {
            return record.fingerprint.starts_with(prefix.as_str())
                || record.hashed_fingerprint().starts_with(prefix.as_str());
        }
        record.nickname_lower().contains(&self.lower)
            || record.fingerprint.starts_with(&self.upper)
            || record.hashed_fingerprint().starts_with(&self.upper)
            || record
                .base64_fingerprint()
                .map_or(false, |b64| b64.starts_with(&self.raw))
            || (self.raw.len() == 4
                && record.sorted_hex_blocks().binary_search(&self.upper).is_ok())
            || record.addresses.iter().any(|a| a.starts_with(&self.lower))
    }

    fn matches_bridge(&self, record: &SummaryRecord) -> bool {
        if let Some(prefix) = &self.dollar {
            return record.fingerprint.starts_with(prefix.as_str())
                || record.hashed_fingerprint().starts_with(prefix.as_str());
        }
        record.nickname_lower().contains(&self.lower)
            || record.fingerprint.starts_with(&self.upper)
            || record.hashed_fingerprint().starts_with(&self.upper)
    }
}

fn retain_in(candidates: &mut Candidates, keep: Option<&KeySet>) {
    match keep {
        Some(keep) => candidates.retain(|key, _| keep.contains(key)),
        None => candidates.clear(),
    }
}

fn retain_in_union<'a>(candidates: &mut Candidates, sets: impl Iterator<Item = &'a KeySet>) {
    let keep: HashSet<&NodeKey> = sets.flatten().collect();
    candidates.retain(|key, _| keep.contains(key));
}

fn retain_in_days(candidates: &mut Candidates, buckets: &BTreeMap<u32, KeySet>, days: DaysRange) {
    retain_in_union(candidates, buckets.range(days.min()..=days.max()).map(|(_, set)| set));
}

/// Lay out survivors in `order`; anything not in it (a record fetched from
/// the source) goes last, by fingerprint.
fn in_base_order(mut candidates: Candidates, order: &[NodeKey]) -> Vec<Arc<SummaryRecord>> {
    let mut ordered = Vec::with_capacity(candidates.len());
    for key in order {
        if candidates.is_empty() {
            break;
        }
        if let Some(record) = candidates.remove(key) {
            ordered.push(record);
        }
    }
    let mut rest: Vec<_> = candidates.into_values().collect();
    rest.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    ordered.extend(rest);
    ordered
}

/// Runs the filter, order and paging stages of one request.
pub struct RequestHandler<'a> {
    index: Arc<NodeIndex>,
    source: &'a dyn SummarySource,
    resource: ResourceType,
    query: &'a QueryParams,
    search: Vec<SearchTerm>,
}

impl<'a> RequestHandler<'a> {
    pub fn new(
        index: Arc<NodeIndex>,
        source: &'a dyn SummarySource,
        resource: ResourceType,
        query: &'a QueryParams,
    ) -> Self {
        RequestHandler {
            index,
            source,
            resource,
            query,
            search: query.search.iter().map(|t| SearchTerm::new(t)).collect(),
        }
    }

    /// The snapshot this request runs against
    pub fn index(&self) -> &Arc<NodeIndex> {
        &self.index
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    pub fn handle(&self) -> Result<QueryResult> {
        let mut relays: Candidates = self.index.relays().clone();
        let mut bridges: Candidates = self.index.bridges().clone();

        self.filter_by_kind(&mut relays, &mut bridges);
        self.filter_by_running(&mut relays, &mut bridges);
        self.filter_by_search(&mut relays, &mut bridges);
        self.filter_by_lookup(&mut relays, &mut bridges);
        self.filter_by_fingerprint(&mut relays, &mut bridges)?;
        self.filter_by_country(&mut relays, &mut bridges);
        self.filter_by_as_number(&mut relays, &mut bridges);
        self.filter_by_as_name(&mut relays, &mut bridges);
        self.filter_by_flag(&mut relays, &mut bridges);
        self.filter_by_days(&mut relays, &mut bridges);
        self.filter_by_contact(&mut relays, &mut bridges);
        self.filter_by_family(&mut relays, &mut bridges);
        self.filter_by_software(&mut relays, &mut bridges);

        let mut result = QueryResult {
            relays: in_base_order(relays, self.index.relay_order()),
            bridges: in_base_order(bridges, self.index.bridge_order()),
            ..QueryResult::default()
        };

        let orderer = Orderer::new(self.query.order.clone());
        orderer.sort(&mut result.relays);
        orderer.sort(&mut result.bridges);

        self.paginate(&mut result);
        debug!(
            relays = result.relays.len(),
            bridges = result.bridges.len(),
            "Request matched"
        );
        Ok(result)
    }

    fn relays_allowed(&self) -> bool {
        self.resource.serves_relays() && self.query.kind.map_or(true, |k| k.is_relay())
    }

    fn bridges_allowed(&self) -> bool {
        self.resource.serves_bridges() && self.query.kind.map_or(true, |k| !k.is_relay())
    }

    // Stages 1 and 2
    fn filter_by_kind(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if !self.relays_allowed() {
            relays.clear();
        }
        if !self.bridges_allowed() {
            bridges.clear();
        }
    }

    fn filter_by_running(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(running) = self.query.running {
            relays.retain(|_, r| r.running == running);
            bridges.retain(|_, r| r.running == running);
        }
    }

    fn filter_by_search(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        for term in &self.search {
            relays.retain(|_, r| term.matches_relay(r));
            bridges.retain(|_, r| term.matches_bridge(r));
        }
    }

    fn filter_by_lookup(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        let Some(lookup) = self.query.lookup.as_deref() else {
            return;
        };
        match self.index.relay_key(lookup) {
            Some(key) => relays.retain(|k, _| k == key),
            None => relays.clear(),
        }
        match self.index.bridge_key(lookup) {
            Some(key) => bridges.retain(|k, _| k == key),
            None => bridges.clear(),
        }
    }

    /// Whether a record fetched outside the snapshot passes stages 1-5.
    fn passes_earlier_stages(&self, record: &SummaryRecord) -> bool {
        let kind_allowed = if record.is_relay() {
            self.relays_allowed()
        } else {
            self.bridges_allowed()
        };
        let search = self.search.iter().all(|term| {
            if record.is_relay() {
                term.matches_relay(record)
            } else {
                term.matches_bridge(record)
            }
        });
        let lookup = self.query.lookup.as_deref().map_or(true, |lookup| {
            record.fingerprint == lookup || record.hashed_fingerprint() == lookup
        });
        kind_allowed && self.query.running.map_or(true, |r| record.running == r) && search && lookup
    }

    fn filter_by_fingerprint(&self, relays: &mut Candidates, bridges: &mut Candidates) -> Result<()> {
        let Some(fingerprint) = self.query.fingerprint.as_deref() else {
            return Ok(());
        };
        relays.clear();
        bridges.clear();

        let Some(mut record) = self.source.retrieve(fingerprint)? else {
            return Ok(());
        };
        if let Err(e) = record.init_cache() {
            debug!(error = %e, "Ignoring unusable record from source");
            return Ok(());
        }
        if !self.passes_earlier_stages(&record) {
            return Ok(());
        }

        let key: NodeKey = Arc::from(record.fingerprint.as_str());
        let record = Arc::new(record);
        if record.is_relay() {
            relays.insert(key, record);
        } else {
            bridges.insert(key, record);
        }
        Ok(())
    }

    fn filter_by_country(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(country) = self.query.country.as_deref() {
            retain_in(relays, self.index.relays_by_country(country));
            bridges.clear();
        }
    }

    fn filter_by_as_number(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(as_number) = self.query.as_number.as_deref() {
            retain_in(relays, self.index.relays_by_as(as_number));
            bridges.clear();
        }
    }

    fn filter_by_as_name(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        let Some(tokens) = &self.query.as_name else {
            return;
        };
        let matching = self
            .index
            .relays_by_as_name()
            .iter()
            .filter(|(as_name, _)| tokens.iter().all(|t| as_name.contains(t.as_str())))
            .map(|(_, keys)| keys);
        retain_in_union(relays, matching);
        bridges.clear();
    }

    fn filter_by_flag(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(flag) = self.query.flag.as_deref() {
            retain_in(relays, self.index.relays_by_flag(flag));
            retain_in(bridges, self.index.bridges_by_flag(flag));
        }
    }

    fn filter_by_days(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(days) = self.query.first_seen_days {
            retain_in_days(relays, self.index.relays_by_first_seen_days(), days);
            retain_in_days(bridges, self.index.bridges_by_first_seen_days(), days);
        }
        if let Some(days) = self.query.last_seen_days {
            retain_in_days(relays, self.index.relays_by_last_seen_days(), days);
            retain_in_days(bridges, self.index.bridges_by_last_seen_days(), days);
        }
    }

    fn filter_by_contact(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        let Some(tokens) = &self.query.contact else {
            return;
        };
        let matching = self
            .index
            .relays_by_contact()
            .iter()
            .filter(|(contact, _)| tokens.iter().all(|t| contact.contains(t.as_str())))
            .map(|(_, keys)| keys);
        retain_in_union(relays, matching);
        bridges.clear();
    }

    fn filter_by_family(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        let Some(family) = self.query.family.as_deref() else {
            return;
        };
        let key = self
            .index
            .relay_key(family)
            .cloned()
            .unwrap_or_else(|| Arc::from(family));
        let members = self.index.relay_family(&key);
        relays.retain(|k, _| *k == key || members.map_or(false, |m| m.contains(k)));
        bridges.clear();
    }

    // Stage 13
    fn filter_by_software(&self, relays: &mut Candidates, bridges: &mut Candidates) {
        if let Some(specs) = &self.query.version {
            let matches = |version: &crate::version::TorVersion| specs.iter().any(|s| s.matches(version));
            retain_in_union(
                relays,
                self.index
                    .relays_by_version()
                    .iter()
                    .filter(|(v, _)| matches(v))
                    .map(|(_, keys)| keys),
            );
            retain_in_union(
                bridges,
                self.index
                    .bridges_by_version()
                    .iter()
                    .filter(|(v, _)| matches(v))
                    .map(|(_, keys)| keys),
            );
        }
        if let Some(os) = self.query.os.as_deref() {
            retain_in_union(
                relays,
                self.index
                    .relays_by_os()
                    .iter()
                    .filter(|(name, _)| name.starts_with(os))
                    .map(|(_, keys)| keys),
            );
            retain_in_union(
                bridges,
                self.index
                    .bridges_by_os()
                    .iter()
                    .filter(|(name, _)| name.starts_with(os))
                    .map(|(_, keys)| keys),
            );
        }
        if let Some(host_name) = self.query.host_name.as_deref() {
            retain_in_union(
                relays,
                self.index
                    .relays_by_host_name()
                    .iter()
                    .filter(|(name, _)| name.ends_with(host_name))
                    .map(|(_, keys)| keys),
            );
            bridges.clear();
        }
        if let Some(recommended) = self.query.recommended_version {
            retain_in(relays, self.index.relays_by_recommended_version(recommended));
            retain_in(bridges, self.index.bridges_by_recommended_version(recommended));
        }
    }

    fn paginate(&self, result: &mut QueryResult) {
        if let Some(offset) = self.query.offset {
            result.relays_skipped = offset.min(result.relays.len());
            result.relays.drain(..result.relays_skipped);
            result.bridges_skipped = (offset - result.relays_skipped).min(result.bridges.len());
            result.bridges.drain(..result.bridges_skipped);
        }
        if let Some(limit) = self.query.limit {
            result.relays_truncated = result.relays.len().saturating_sub(limit);
            result.relays.truncate(limit);
            let remaining = limit - result.relays.len();
            result.bridges_truncated = result.bridges.len().saturating_sub(remaining);
            result.bridges.truncate(remaining);
        }
    }
}

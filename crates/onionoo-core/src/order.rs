//! Result ordering.
//!
//! An `order` parameter is a comma-separated list of field names, each
//! optionally prefixed with `-` for descending. Keys are compared left to
//! right and the first non-equal key decides; full ties keep their incoming
//! relative order.

use crate::error::{OnionooError, Result};
use crate::types::SummaryRecord;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A field results can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderField {
    ConsensusWeight,
    FirstSeen,
}

impl OrderField {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderField::ConsensusWeight => "consensus_weight",
            OrderField::FirstSeen => "first_seen",
        }
    }

    fn compare(&self, a: &SummaryRecord, b: &SummaryRecord) -> Ordering {
        match self {
            OrderField::ConsensusWeight => a.consensus_weight.cmp(&b.consensus_weight),
            OrderField::FirstSeen => a.first_seen.cmp(&b.first_seen),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One `(field, direction)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub field: OrderField,
    pub direction: Direction,
}

impl OrderKey {
    pub fn ascending(field: OrderField) -> Self {
        OrderKey {
            field,
            direction: Direction::Ascending,
        }
    }

    pub fn descending(field: OrderField) -> Self {
        OrderKey {
            field,
            direction: Direction::Descending,
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.direction == Direction::Descending {
            write!(f, "-")?;
        }
        write!(f, "{}", self.field.as_str())
    }
}

/// Parse an `order` parameter value.
///
/// Field names are case-insensitive. Unknown fields, empty entries and a field
/// named twice are rejected.
pub fn parse_order(value: &str) -> Result<Vec<OrderKey>> {
    let mut keys: Vec<OrderKey> = Vec::new();
    for raw in value.split(',') {
        let lower = raw.to_ascii_lowercase();
        let (direction, name) = match lower.strip_prefix('-') {
            Some(name) => (Direction::Descending, name),
            None => (Direction::Ascending, lower.as_str()),
        };
        let field = match name {
            "consensus_weight" => OrderField::ConsensusWeight,
            "first_seen" => OrderField::FirstSeen,
            _ => {
                return Err(OnionooError::invalid_parameter(
                    "order",
                    format!("unknown field '{}'", raw),
                ))
            }
        };
        if keys.iter().any(|k| k.field == field) {
            return Err(OnionooError::invalid_parameter(
                "order",
                format!("field '{}' given more than once", field.as_str()),
            ));
        }
        keys.push(OrderKey { field, direction });
    }
    Ok(keys)
}

/// Multi-key comparator over summary records.
#[derive(Debug, Clone, Default)]
pub struct Orderer {
    keys: Vec<OrderKey>,
}

impl Orderer {
    pub fn new(keys: Vec<OrderKey>) -> Self {
        Orderer { keys }
    }

    pub fn compare(&self, a: &SummaryRecord, b: &SummaryRecord) -> Ordering {
        for key in &self.keys {
            let ordering = key.field.compare(a, b);
            let ordering = match key.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable sort; a no-op without keys.
    pub fn sort(&self, records: &mut [Arc<SummaryRecord>]) {
        if self.keys.is_empty() {
            return;
        }
        records.sort_by(|a, b| self.compare(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{now, relay, F1, F2, F3};
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_parse_order() {
        assert_eq!(
            parse_order("consensus_weight").unwrap(),
            vec![OrderKey::ascending(OrderField::ConsensusWeight)]
        );
        assert_eq!(
            parse_order("-First_Seen,consensus_weight").unwrap(),
            vec![
                OrderKey::descending(OrderField::FirstSeen),
                OrderKey::ascending(OrderField::ConsensusWeight),
            ]
        );
    }

    #[test]
    fn test_parse_order_rejects() {
        assert!(parse_order("nickname").unwrap_err().is_invalid_input());
        assert!(parse_order("consensus_weight,-consensus_weight").is_err());
        assert!(parse_order("").is_err());
        assert!(parse_order("first_seen,").is_err());
        assert!(parse_order("--first_seen").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            OrderKey::descending(OrderField::ConsensusWeight).to_string(),
            "-consensus_weight"
        );
    }

    #[test]
    fn test_multi_key_compare() {
        let a = relay(F1)
            .with_consensus_weight(10)
            .with_first_seen(now() - Duration::days(3));
        let b = relay(F2)
            .with_consensus_weight(10)
            .with_first_seen(now() - Duration::days(5));
        let orderer = Orderer::new(vec![
            OrderKey::descending(OrderField::ConsensusWeight),
            OrderKey::ascending(OrderField::FirstSeen),
        ]);
        assert_eq!(orderer.compare(&a, &b), Ordering::Greater);
        assert_eq!(orderer.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut records = vec![
            Arc::new(relay(F3).with_consensus_weight(5)),
            Arc::new(relay(F1).with_consensus_weight(1)),
            Arc::new(relay(F2).with_consensus_weight(5)),
        ];
        Orderer::new(vec![OrderKey::descending(OrderField::ConsensusWeight)]).sort(&mut records);
        let order: Vec<&str> = records.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(order, vec![F3, F2, F1]);
    }

    #[test]
    fn test_empty_orderer_keeps_order() {
        let mut records = vec![
            Arc::new(relay(F3).with_consensus_weight(9)),
            Arc::new(relay(F1).with_consensus_weight(1)),
        ];
        Orderer::default().sort(&mut records);
        assert_eq!(records[0].fingerprint, F3);
    }

    fn arb_weights() -> impl Strategy<Value = Vec<(u64, i64)>> {
        prop::collection::vec((0u64..5, 0i64..5), 0..30)
    }

    fn records(rows: &[(u64, i64)]) -> Vec<Arc<SummaryRecord>> {
        rows.iter()
            .enumerate()
            .map(|(i, (weight, days))| {
                Arc::new(
                    SummaryRecord::relay(format!("{:040X}", i))
                        .with_consensus_weight(*weight)
                        .with_first_seen(now() - Duration::days(*days)),
                )
            })
            .collect()
    }

    fn sort_values(records: &[Arc<SummaryRecord>]) -> Vec<(u64, i64)> {
        records
            .iter()
            .map(|r| (r.consensus_weight, r.first_seen.timestamp()))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_sort_twice_identical(rows in arb_weights()) {
            let orderer = Orderer::new(vec![
                OrderKey::ascending(OrderField::ConsensusWeight),
                OrderKey::descending(OrderField::FirstSeen),
            ]);
            let mut once = records(&rows);
            orderer.sort(&mut once);
            let mut twice = once.clone();
            orderer.sort(&mut twice);
            let once_ids: Vec<_> = once.iter().map(|r| r.fingerprint.clone()).collect();
            let twice_ids: Vec<_> = twice.iter().map(|r| r.fingerprint.clone()).collect();
            prop_assert_eq!(once_ids, twice_ids);
        }

        #[test]
        fn prop_ascending_reversed_is_descending(rows in arb_weights()) {
            let mut ascending = records(&rows);
            Orderer::new(vec![OrderKey::ascending(OrderField::ConsensusWeight)]).sort(&mut ascending);
            let mut descending = records(&rows);
            Orderer::new(vec![OrderKey::descending(OrderField::ConsensusWeight)]).sort(&mut descending);

            let mut reversed: Vec<u64> = sort_values(&ascending).into_iter().map(|(w, _)| w).collect();
            reversed.reverse();
            let descending: Vec<u64> = sort_values(&descending).into_iter().map(|(w, _)| w).collect();
            prop_assert_eq!(reversed, descending);
        }
    }
}

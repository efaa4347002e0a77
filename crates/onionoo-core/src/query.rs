//! Query parameter parsing and validation.
//!
//! Every parameter is validated here, before the request pipeline runs.
//! Malformed values are rejected as [`OnionooError::InvalidParameter`] and never
//! coerced; unknown parameter names are rejected as
//! [`OnionooError::UnknownParameter`].
//!
//! ## Search Syntax
//!
//! The `search` parameter holds space-separated terms; double quotes group a
//! term that contains spaces. A term `key:value` is a qualifier and is routed to
//! the parameter `key` unless that parameter was given explicitly:
//!
//! - `search=moria` - nickname, fingerprint, or address match
//! - `search=$9695DFC3` - fingerprint prefix
//! - `search=country:de flag:exit` - same as `country=de&flag=exit`
//! - `search=contact:"tor admin"` - qualifier value with a space

use crate::error::{OnionooError, Result};
use crate::index::canonical_as_number;
use crate::order::{parse_order, OrderKey};
use crate::types::NodeKind;
use crate::version::VersionSpec;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

macro_rules! regex {
    ($re:literal) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($re).expect("pattern literal compiles"))
    }};
}

/// Every parameter name the engine accepts.
pub const KNOWN_PARAMETERS: &[&str] = &[
    "type",
    "running",
    "search",
    "lookup",
    "fingerprint",
    "country",
    "as",
    "as_name",
    "flag",
    "first_seen_days",
    "last_seen_days",
    "contact",
    "family",
    "version",
    "os",
    "host_name",
    "recommended_version",
    "order",
    "limit",
    "offset",
    "fields",
];

/// Parameters that cannot appear as `key:value` inside `search`.
pub const ILLEGAL_SEARCH_QUALIFIERS: &[&str] =
    &["search", "fingerprint", "order", "limit", "offset", "fields"];

/// The kind of document a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Summary,
    Details,
    Bandwidth,
    Weights,
    Clients,
    Uptime,
}

impl ResourceType {
    /// Resolve a request path such as `/details`, `/onionoo/summary` or `uptime`.
    pub fn from_path(path: &str) -> Result<Self> {
        let trimmed = path.trim_start_matches('/');
        let trimmed = trimmed.strip_prefix("onionoo/").unwrap_or(trimmed);
        let name = trimmed.split(['/', '?']).next().unwrap_or_default();
        match name {
            "summary" => Ok(ResourceType::Summary),
            "details" => Ok(ResourceType::Details),
            "bandwidth" => Ok(ResourceType::Bandwidth),
            "weights" => Ok(ResourceType::Weights),
            "clients" => Ok(ResourceType::Clients),
            "uptime" => Ok(ResourceType::Uptime),
            _ => Err(OnionooError::UnknownResource {
                path: path.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Summary => "summary",
            ResourceType::Details => "details",
            ResourceType::Bandwidth => "bandwidth",
            ResourceType::Weights => "weights",
            ResourceType::Clients => "clients",
            ResourceType::Uptime => "uptime",
        }
    }

    /// Whether documents of this kind exist for relays
    pub fn serves_relays(&self) -> bool {
        !matches!(self, ResourceType::Clients)
    }

    /// Whether documents of this kind exist for bridges
    pub fn serves_bridges(&self) -> bool {
        !matches!(self, ResourceType::Weights)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive range of whole days, never inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaysRange {
    min: u32,
    max: u32,
}

impl DaysRange {
    /// `None` when `min` exceeds `max`.
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min <= max).then_some(DaysRange { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Parse `N`, `N-M`, `N-` or `-M`.
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        if !regex!(r"^[0-9-]{1,10}$").is_match(value) {
            return Err(OnionooError::invalid_parameter(name, "expected N, N-M, N- or -M"));
        }
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| OnionooError::invalid_parameter(name, format!("'{}' is not a day count", s)))
        };
        let (min, max) = match value.split_once('-') {
            None => {
                let n = number(value)?;
                (n, n)
            }
            Some((lo, hi)) => {
                let min = if lo.is_empty() { 0 } else { number(lo)? };
                let max = if hi.is_empty() { u32::MAX } else { number(hi)? };
                (min, max)
            }
        };
        DaysRange::new(min, max)
            .ok_or_else(|| OnionooError::invalid_parameter(name, "lower bound exceeds upper bound"))
    }
}

/// A fully validated query.
///
/// String values are normalized to the case the index stores them in:
/// fingerprints upper-case; country, flag, contact, os and host name
/// lower-case; AS numbers as `AS<n>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub kind: Option<NodeKind>,
    pub running: Option<bool>,
    /// Unqualified search terms, as given
    pub search: Vec<String>,
    pub lookup: Option<String>,
    pub fingerprint: Option<String>,
    pub country: Option<String>,
    pub as_number: Option<String>,
    /// AS name tokens; every one must appear in a matching AS name
    pub as_name: Option<Vec<String>>,
    pub flag: Option<String>,
    pub first_seen_days: Option<DaysRange>,
    pub last_seen_days: Option<DaysRange>,
    /// Contact tokens; every one must appear in a matching contact
    pub contact: Option<Vec<String>>,
    pub family: Option<String>,
    /// Any one spec must match
    pub version: Option<Vec<VersionSpec>>,
    pub os: Option<String>,
    pub host_name: Option<String>,
    pub recommended_version: Option<bool>,
    pub order: Vec<OrderKey>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    /// Requested document fields, passed through to the formatter
    pub fields: Option<Vec<String>>,
}

impl QueryParams {
    /// Validate decoded `(name, value)` pairs. The first value given for a
    /// name wins.
    pub fn parse<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            if !KNOWN_PARAMETERS.contains(&key) {
                return Err(OnionooError::UnknownParameter {
                    name: key.to_string(),
                });
            }
            params
                .entry(key.to_string())
                .or_insert_with(|| value.as_ref().to_string());
        }

        let mut query = QueryParams::default();

        if let Some(search) = params.get("search").cloned() {
            for term in tokenize_search(&search)? {
                match term.split_once(':') {
                    Some((key, value)) if !term.starts_with('[') => {
                        if !KNOWN_PARAMETERS.contains(&key) || ILLEGAL_SEARCH_QUALIFIERS.contains(&key) {
                            return Err(OnionooError::invalid_parameter(
                                "search",
                                format!("'{}' cannot be used as a search qualifier", key),
                            ));
                        }
                        params
                            .entry(key.to_string())
                            .or_insert_with(|| value.to_string());
                    }
                    _ => {
                        validate_search_term(&term)?;
                        query.search.push(term);
                    }
                }
            }
        }

        for (name, value) in &params {
            let value = value.as_str();
            match name.as_str() {
                "search" => {}
                "type" => {
                    query.kind = Some(match value.to_ascii_lowercase().as_str() {
                        "relay" => NodeKind::Relay,
                        "bridge" => NodeKind::Bridge,
                        _ => return Err(OnionooError::invalid_parameter(name, "expected relay or bridge")),
                    })
                }
                "running" => query.running = Some(parse_bool(name, value)?),
                "lookup" => query.lookup = Some(parse_fingerprint(name, value)?),
                "fingerprint" => query.fingerprint = Some(parse_fingerprint(name, value)?),
                "family" => query.family = Some(parse_fingerprint(name, value)?),
                "country" => {
                    if !regex!(r"^[0-9a-zA-Z]{2}$").is_match(value) {
                        return Err(OnionooError::invalid_parameter(name, "expected a two-letter country code"));
                    }
                    query.country = Some(value.to_ascii_lowercase());
                }
                "as" => {
                    let canonical = regex!(r"^(?i:as)?[0-9]{1,10}$")
                        .is_match(value)
                        .then(|| canonical_as_number(value))
                        .flatten()
                        .ok_or_else(|| OnionooError::invalid_parameter(name, "expected an AS number"))?;
                    query.as_number = Some(canonical);
                }
                "as_name" => {
                    if !value.bytes().all(|b| (32..127).contains(&b)) {
                        return Err(OnionooError::invalid_parameter(name, "expected printable ASCII"));
                    }
                    query.as_name = Some(
                        value
                            .split(' ')
                            .filter(|part| !part.is_empty())
                            .map(str::to_lowercase)
                            .collect(),
                    );
                }
                "flag" => {
                    if !regex!(r"^[a-zA-Z0-9]{1,20}$").is_match(value) {
                        return Err(OnionooError::invalid_parameter(name, "expected a relay flag"));
                    }
                    query.flag = Some(value.to_ascii_lowercase());
                }
                "first_seen_days" => query.first_seen_days = Some(DaysRange::parse(name, value)?),
                "last_seen_days" => query.last_seen_days = Some(DaysRange::parse(name, value)?),
                "contact" => {
                    if !value.bytes().all(|b| (32..127).contains(&b)) {
                        return Err(OnionooError::invalid_parameter(name, "expected printable ASCII"));
                    }
                    query.contact = Some(
                        value
                            .split(' ')
                            .filter(|part| !part.is_empty())
                            .map(str::to_ascii_lowercase)
                            .collect(),
                    );
                }
                "version" => {
                    let specs = value
                        .split(',')
                        .map(str::parse)
                        .collect::<std::result::Result<Vec<VersionSpec>, _>>()
                        .map_err(|e| OnionooError::invalid_parameter(name, e.to_string()))?;
                    query.version = Some(specs);
                }
                "os" => {
                    if !regex!(r"^[0-9a-zA-Z_ .-]{1,32}$").is_match(value) {
                        return Err(OnionooError::invalid_parameter(name, "expected an operating system name"));
                    }
                    query.os = Some(value.to_ascii_lowercase());
                }
                "host_name" => {
                    if !regex!(r"^[0-9a-zA-Z_.-]{1,253}$").is_match(value) {
                        return Err(OnionooError::invalid_parameter(name, "expected a host name"));
                    }
                    query.host_name = Some(value.to_ascii_lowercase());
                }
                "recommended_version" => query.recommended_version = Some(parse_bool(name, value)?),
                "order" => query.order = parse_order(value)?,
                "offset" => query.offset = Some(parse_count(name, value)?),
                "limit" => query.limit = Some(parse_count(name, value)?),
                "fields" => {
                    if !regex!(r"^[0-9a-zA-Z_,]*$").is_match(value) {
                        return Err(OnionooError::invalid_parameter(name, "expected comma-separated field names"));
                    }
                    query.fields = Some(
                        value
                            .split(',')
                            .filter(|f| !f.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                _ => {
                    return Err(OnionooError::Internal(format!(
                        "parameter '{}' accepted but not handled",
                        name
                    )))
                }
            }
        }

        Ok(query)
    }

    /// Validate a URL query string such as `type=relay&limit=5`.
    ///
    /// Values are percent-decoded. Inside `search`, `+` stays literal so
    /// base64 fingerprints survive.
    pub fn parse_query_string(query: &str) -> Result<Self> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut pairs: Vec<(String, String)> = Vec::new();
        for raw in query.split('&').filter(|raw| !raw.is_empty()) {
            let raw = if raw.starts_with("search=") {
                Cow::Owned(raw.replace('+', "%2B"))
            } else {
                Cow::Borrowed(raw)
            };
            pairs.extend(url::form_urlencoded::parse(raw.as_bytes()).into_owned());
        }
        Self::parse(pairs)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(OnionooError::invalid_parameter(name, "expected true or false")),
    }
}

fn parse_fingerprint(name: &str, value: &str) -> Result<String> {
    if !regex!(r"^[0-9a-fA-F]{40}$").is_match(value) {
        return Err(OnionooError::invalid_parameter(name, "expected 40 hex characters"));
    }
    Ok(value.to_ascii_uppercase())
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    if !regex!(r"^[0-9]{1,6}$").is_match(value) {
        return Err(OnionooError::invalid_parameter(name, "expected at most 6 digits"));
    }
    value
        .parse()
        .map_err(|_| OnionooError::invalid_parameter(name, "expected at most 6 digits"))
}

/// Split a search value into terms. Double quotes group characters,
/// including spaces, into the current term and are dropped.
pub fn tokenize_search(value: &str) -> Result<Vec<String>> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in value.chars() {
        match c {
            '"' => quoted = !quoted,
            ' ' if !quoted => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(OnionooError::invalid_parameter("search", "unbalanced quote"));
    }
    if !current.is_empty() {
        terms.push(current);
    }
    Ok(terms)
}

fn validate_search_term(term: &str) -> Result<()> {
    let valid = regex!(r"^\$?[0-9a-fA-F]{1,40}$").is_match(term)
        || regex!(r"^[0-9a-zA-Z+/]{1,27}$").is_match(term)
        || regex!(r"^[0-9a-zA-Z.]{1,19}$").is_match(term)
        || regex!(r"^\[[0-9a-fA-F:.]{1,39}\]?$").is_match(term);
    if valid {
        Ok(())
    } else {
        Err(OnionooError::invalid_parameter(
            "search",
            format!("'{}' is not a fingerprint, nickname or address", term),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderField;

    const FP: &str = "000C5F55BD4814B917CC474BD537F1A3B33CCE2A";

    fn parse(query: &str) -> Result<QueryParams> {
        QueryParams::parse_query_string(query)
    }

    #[test]
    fn test_resource_type() {
        assert_eq!(ResourceType::from_path("/summary").unwrap(), ResourceType::Summary);
        assert_eq!(ResourceType::from_path("/onionoo/details").unwrap(), ResourceType::Details);
        assert_eq!(ResourceType::from_path("uptime").unwrap(), ResourceType::Uptime);
        assert!(!ResourceType::Clients.serves_relays());
        assert!(!ResourceType::Weights.serves_bridges());
        assert!(ResourceType::from_path("/status").unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_empty_query() {
        assert_eq!(parse("").unwrap(), QueryParams::default());
        assert_eq!(parse("?").unwrap(), QueryParams::default());
    }

    #[test]
    fn test_unknown_parameter() {
        let err = parse("colour=red").unwrap_err();
        assert!(matches!(err, OnionooError::UnknownParameter { .. }));
    }

    #[test]
    fn test_basic_parameters() {
        let query = parse(&format!(
            "type=Relay&running=TRUE&lookup={}&country=DE&as=as03320&flag=Exit&offset=2&limit=10",
            FP.to_lowercase()
        ))
        .unwrap();
        assert_eq!(query.kind, Some(NodeKind::Relay));
        assert_eq!(query.running, Some(true));
        assert_eq!(query.lookup.as_deref(), Some(FP));
        assert_eq!(query.country.as_deref(), Some("de"));
        assert_eq!(query.as_number.as_deref(), Some("AS3320"));
        assert_eq!(query.flag.as_deref(), Some("exit"));
        assert_eq!(query.offset, Some(2));
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn test_as_name_tokens() {
        let query = parse("as_name=Hetzner%20%20Online").unwrap();
        assert_eq!(query.as_name, Some(vec!["hetzner".to_string(), "online".to_string()]));
        assert!(parse("as_name=%01").is_err());
    }

    #[test]
    fn test_first_value_wins() {
        let query = parse("limit=1&limit=2").unwrap();
        assert_eq!(query.limit, Some(1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for bad in [
            "type=node",
            "running=yes",
            "lookup=ABCD",
            "fingerprint=ZZ0C5F55BD4814B917CC474BD537F1A3B33CCE2A",
            "country=deu",
            "as=AS4294967296",
            "as=ASN3320",
            "flag=Hidden_Service",
            "first_seen_days=5-2",
            "last_seen_days=x",
            "contact=caf%C3%A9",
            "version=x.y",
            "os=%3Cscript%3E",
            "host_name=a%20b",
            "recommended_version=maybe",
            "order=nickname",
            "offset=1234567",
            "limit=-1",
            "fields=a;b",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(err.is_invalid_input(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_days_range() {
        assert_eq!(DaysRange::parse("d", "3").unwrap(), DaysRange::new(3, 3).unwrap());
        assert_eq!(DaysRange::parse("d", "3-7").unwrap(), DaysRange::new(3, 7).unwrap());
        assert_eq!(DaysRange::parse("d", "3-").unwrap(), DaysRange::new(3, u32::MAX).unwrap());
        assert_eq!(DaysRange::parse("d", "-7").unwrap(), DaysRange::new(0, 7).unwrap());
        assert!(DaysRange::parse("d", "1-2-3").is_err());
        assert!(DaysRange::parse("d", "").is_err());
        assert!(DaysRange::parse("d", "7-3").unwrap_err().is_invalid_input());

        let range = DaysRange::new(3, 7).unwrap();
        assert_eq!((range.min(), range.max()), (3, 7));
        assert!(DaysRange::new(7, 3).is_none());
    }

    #[test]
    fn test_contact_tokens() {
        let query = parse("contact=Tor%20Admin").unwrap();
        assert_eq!(query.contact, Some(vec!["tor".to_string(), "admin".to_string()]));
    }

    #[test]
    fn test_version_list() {
        let query = parse("version=0.4.8,0.3.5..0.4.0").unwrap();
        assert_eq!(query.version.unwrap().len(), 2);
    }

    #[test]
    fn test_order() {
        let query = parse("order=-consensus_weight,first_seen").unwrap();
        assert_eq!(
            query.order,
            vec![
                OrderKey::descending(OrderField::ConsensusWeight),
                OrderKey::ascending(OrderField::FirstSeen),
            ]
        );
        assert!(parse("order=first_seen,first_seen").is_err());
    }

    #[test]
    fn test_tokenize_search() {
        assert_eq!(tokenize_search("a  b").unwrap(), vec!["a", "b"]);
        assert_eq!(
            tokenize_search(r#"contact:"tor admin" moria"#).unwrap(),
            vec!["contact:tor admin", "moria"]
        );
        assert!(tokenize_search(r#""open"#).is_err());
    }

    #[test]
    fn test_search_terms() {
        let query = parse("search=moria1%20$000C5F55%20[2001:db8::").unwrap();
        assert_eq!(query.search, vec!["moria1", "$000C5F55", "[2001:db8::"]);

        let query = parse("search=AAxfVb1IFLkX+zEd").unwrap();
        assert_eq!(query.search, vec!["AAxfVb1IFLkX+zEd"]);

        assert!(parse("search=a%3Cb").is_err());
    }

    #[test]
    fn test_search_qualifiers() {
        let query = parse("search=country:de%20flag:Exit%20moria").unwrap();
        assert_eq!(query.country.as_deref(), Some("de"));
        assert_eq!(query.flag.as_deref(), Some("exit"));
        assert_eq!(query.search, vec!["moria"]);

        let query = parse(r#"search=contact:%22tor%20admin%22"#).unwrap();
        assert_eq!(query.contact, Some(vec!["tor".to_string(), "admin".to_string()]));
    }

    #[test]
    fn test_explicit_parameter_beats_qualifier() {
        let query = parse("country=fr&search=country:de").unwrap();
        assert_eq!(query.country.as_deref(), Some("fr"));
    }

    #[test]
    fn test_illegal_qualifiers() {
        for bad in ["search=limit:5", "search=order:first_seen", "search=colour:red"] {
            assert!(parse(bad).unwrap_err().is_invalid_input(), "{}", bad);
        }
        // A qualifier's value is still validated
        assert!(parse("search=as:ASX").is_err());
    }

    #[test]
    fn test_fields_passthrough() {
        let query = parse("fields=nickname,fingerprint").unwrap();
        assert_eq!(
            query.fields,
            Some(vec!["nickname".to_string(), "fingerprint".to_string()])
        );
    }
}

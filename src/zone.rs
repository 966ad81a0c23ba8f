//! Static zone data.
//!
//! The zone is built once at startup from [`Config`] and never changes afterwards. It owns the
//! apex `SOA` and `NS` records plus every line of [`Config::records`], parsed as
//! `<owner> [<ttl>] [IN] <TYPE> <rdata...>`.
//!
//! Owners ending in `.` are absolute, `@` is the apex, anything else is relative to the apex.
//! Supported types are `A`, `AAAA`, `NS`, `CNAME`, `MX` and `TXT`.

use crate::config::Config;
use crate::error::Error;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use trust_dns_proto::rr::rdata::{MX, SOA, TXT};
use trust_dns_server::client::rr::{LowerName, Name, RData, Record, RecordType};

pub type SharedZone = Arc<Zone>;

const DEFAULT_TTL: u32 = 3600;
const SOA_TTL: u32 = 1;

lazy_static! {
    static ref SERIAL_FORMATTER: &'static [time::format_description::FormatItem<'static>] =
        format_description!(version = 2, "[year][month][day]");
}

/// What the static zone knows about a query name.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticAnswer {
    /// The name is static and has records of the queried type (or a CNAME).
    Records(Vec<Record>),
    /// The name is static (or an empty non-terminal) but has no records of the queried type.
    NoData,
    /// The name isn't part of the static zone.
    NotStatic,
}

#[derive(Debug)]
pub struct Zone {
    origin: Name,
    lower_origin: LowerName,
    ns_domain: Name,
    ns_admin: Name,
    records: HashMap<LowerName, Vec<Record>>,
    interior: HashSet<LowerName>,
}

impl Zone {
    /// Build the zone from configuration, failing on the first malformed record line.
    pub fn try_from_config(config: &Config) -> Result<Self, Error> {
        let origin = fqdn(Name::from(&config.domain).to_lowercase());
        let ns_domain = fqdn(Name::from(&config.ns_domain).to_lowercase());
        let ns_admin = fqdn(config.ns_admin()?);

        let mut records: HashMap<LowerName, Vec<Record>> = HashMap::default();
        for line in config.records.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            let record = parse_record(line, &origin)?;
            records
                .entry(LowerName::from(record.name().clone()))
                .or_default()
                .push(record);
        }

        let apex = records.entry(LowerName::from(origin.clone())).or_default();
        if !apex.iter().any(|r| r.rr_type() == RecordType::NS) {
            apex.push(Record::from_rdata(
                origin.clone(),
                DEFAULT_TTL,
                RData::NS(ns_domain.clone()),
            ));
        }

        let mut interior = HashSet::default();
        for owner in records.keys() {
            let mut name = Name::from(owner).base_name();
            while name.num_labels() > origin.num_labels() {
                interior.insert(LowerName::from(name.clone()));
                name = name.base_name();
            }
        }

        Ok(Zone {
            lower_origin: LowerName::from(origin.clone()),
            origin,
            ns_domain,
            ns_admin,
            records,
            interior,
        })
    }

    /// The apex of the zone.
    pub fn origin(&self) -> &LowerName {
        &self.lower_origin
    }

    /// Whether `name` is the apex or below it.
    pub fn contains(&self, name: &LowerName) -> bool {
        self.origin.zone_of(&Name::from(name))
    }

    /// The apex SOA record. The serial is the current UTC date.
    pub fn soa(&self) -> Record {
        // NB: unwraps are safe: known date format producing values that will always parse as u32.
        let serial: u32 = OffsetDateTime::now_utc()
            .format(&SERIAL_FORMATTER)
            .unwrap()
            .parse()
            .unwrap();
        // See RIPE 203[0] for recommended values.
        // [0]: https://www.ripe.net/publications/docs/ripe-203
        let soa_rdata = RData::SOA(SOA::new(
            self.ns_domain.clone(),
            self.ns_admin.clone(),
            serial,
            86_400,    // 24 hrs.
            7_200,     // 2 hours.
            3_600_000, // 1000 hours.
            172_800,   // 2 days.
        ));
        Record::from_rdata(self.origin.clone(), SOA_TTL, soa_rdata)
    }

    pub fn static_answers(&self, name: &LowerName, query_type: RecordType) -> StaticAnswer {
        let is_apex = *name == self.lower_origin;
        let Some(owned) = self.records.get(name) else {
            if self.interior.contains(name) {
                return StaticAnswer::NoData;
            }
            return StaticAnswer::NotStatic;
        };

        let mut answers: Vec<Record> = owned
            .iter()
            .filter(|r| query_type == RecordType::ANY || r.rr_type() == query_type)
            .cloned()
            .collect();
        if is_apex && matches!(query_type, RecordType::SOA | RecordType::ANY) {
            answers.insert(0, self.soa());
        }
        if answers.is_empty() && query_type != RecordType::CNAME {
            answers = owned
                .iter()
                .filter(|r| r.rr_type() == RecordType::CNAME)
                .cloned()
                .collect();
        }

        if answers.is_empty() {
            StaticAnswer::NoData
        } else {
            StaticAnswer::Records(answers)
        }
    }

    /// The single label a dynamic name carries beneath the apex, lowercased.
    ///
    /// Returns `None` for the apex itself, for names outside the zone, and for names more than
    /// one label below the apex.
    pub fn dynamic_label(&self, name: &LowerName) -> Option<String> {
        let name = Name::from(name);
        if name.num_labels() != self.origin.num_labels() + 1 || !self.origin.zone_of(&name) {
            return None;
        }
        name.iter()
            .next()
            .map(|label| String::from_utf8_lossy(label).to_ascii_lowercase())
    }

    /// The fully qualified name for a dynamic `label` under the apex.
    pub fn fulldomain(&self, label: &str) -> String {
        format!("{label}.{}", self.origin.to_string().trim_end_matches('.'))
    }
}

fn fqdn(mut name: Name) -> Name {
    name.set_fqdn(true);
    name
}

fn parse_record(line: &str, origin: &Name) -> Result<Record, Error> {
    let invalid = |reason: String| Error::InvalidRecord {
        line: line.to_string(),
        reason,
    };

    let tokens = tokenize(line).ok_or_else(|| invalid("unterminated quoted string".into()))?;
    let mut tokens = tokens.iter().map(String::as_str).peekable();

    let owner = tokens.next().ok_or_else(|| invalid("missing owner".into()))?;
    let owner = parse_name(owner, origin).map_err(|e| invalid(e.to_string()))?;
    if !origin.zone_of(&owner) {
        return Err(invalid(format!("owner is outside of zone {origin}")));
    }

    let mut ttl = DEFAULT_TTL;
    if let Some(t) = tokens.peek().and_then(|t| t.parse::<u32>().ok()) {
        ttl = t;
        tokens.next();
    }
    if tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("IN")) {
        tokens.next();
    }

    let rtype = tokens
        .next()
        .ok_or_else(|| invalid("missing record type".into()))?
        .to_ascii_uppercase();
    let rdata: Vec<&str> = tokens.collect();
    let single = || match rdata.as_slice() {
        [value] => Ok(*value),
        _ => Err(invalid(format!("{rtype} takes exactly one value"))),
    };

    let rdata = match rtype.as_str() {
        "A" => RData::A(
            single()?
                .parse::<Ipv4Addr>()
                .map_err(|e| invalid(e.to_string()))?,
        ),
        "AAAA" => RData::AAAA(
            single()?
                .parse::<Ipv6Addr>()
                .map_err(|e| invalid(e.to_string()))?,
        ),
        "NS" => RData::NS(parse_name(single()?, origin).map_err(|e| invalid(e.to_string()))?),
        "CNAME" => {
            RData::CNAME(parse_name(single()?, origin).map_err(|e| invalid(e.to_string()))?)
        }
        "MX" => match rdata.as_slice() {
            [preference, exchange] => RData::MX(MX::new(
                preference.parse().map_err(|_| invalid("bad MX preference".into()))?,
                parse_name(exchange, origin).map_err(|e| invalid(e.to_string()))?,
            )),
            _ => return Err(invalid("MX takes a preference and an exchange".into())),
        },
        "TXT" if rdata.is_empty() => return Err(invalid("TXT needs a value".into())),
        "TXT" => RData::TXT(TXT::new(rdata.iter().map(|s| s.to_string()).collect())),
        "SOA" => return Err(invalid("the SOA record is generated from ns_domain/ns_admin".into())),
        other => return Err(invalid(format!("unsupported record type {other}"))),
    };

    Ok(Record::from_rdata(owner, ttl, rdata))
}

fn parse_name(s: &str, origin: &Name) -> Result<Name, Error> {
    let name = if s == "@" {
        origin.clone()
    } else if s.ends_with('.') {
        Name::from_ascii(s)?
    } else {
        Name::from_ascii(s)?.append_domain(origin)?
    };
    Ok(fqdn(name.to_lowercase()))
}

/// Split on whitespace, keeping double-quoted strings (without their quotes) as one token.
fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    Some(tokens)
}

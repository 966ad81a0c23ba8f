//! Authoritative DNS server for the configured zone.
//!
//! # Dynamic TXT Records
//!
//! Every registered subdomain label `<sub>` is served as `<sub>.<domain>`. A `TXT` query for it
//! returns the [RFC-8555][RFC-8555] [DNS-01] challenge values most recently provisioned through
//! the [`/update` API endpoint][crate::api#update-post], newest first, with a TTL of one second.
//!
//! E.g. with config:
//! ```json
//! {
//!   "domain": "auth.example.org",
//!   ...
//! }
//! ```
//!
//! After two updates of the `d420c923-bbd7-4056-ab64-c3ca54c9b3cf` subdomain, a `TXT` query
//! returns both values:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 +short d420c923-bbd7-4056-ab64-c3ca54c9b3cf.auth.example.org TXT
//! "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB"
//! "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
//! ```
//!
//! A registered subdomain with no values yet answers `NOERROR` with no records. Names more than
//! one label below the domain, and labels nobody registered, answer `NXDOMAIN`. Negative answers
//! carry the zone `SOA` in the authority section.
//!
//! [RFC-8555]: https://www.rfc-editor.org/rfc/rfc8555
//! [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4
//!
//! # Static Records
//!
//! The [`records`][crate::config::Config::records] list is served as written and takes
//! precedence over registered subdomains of the same name. Each line is one record in zone file
//! presentation format:
//!
//! ```json
//!   "records": [
//!     "auth.example.org. A 198.51.100.1",
//!     "ns1 A 198.51.100.1",
//!     "www CNAME auth.example.org."
//!   ],
//! ```
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 +short ns1.auth.example.org A
//! 198.51.100.1
//! ```
//!
//! ## SOA and NS
//!
//! The apex `SOA` is generated from [`ns_domain`][crate::config::Config::ns_domain] and
//! [`ns_admin`][crate::config::Config::ns_admin]. An apex `NS` record pointing at `ns_domain`
//! is added unless the records list already has one.
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 +short auth.example.org SOA
//! ns1.auth.example.org. admin.example.org. 20230312 86400 7200 3600000 172800
//! ```
//!
//! _Note: The zone serial (`20230312`) will differ based on the date the query is performed._
//!
//! # Everything else
//!
//! Queries for names outside the zone, or of a class other than `IN`, are `REFUSED`. Opcodes
//! other than `QUERY` get `NOTIMP`. UDP answers that don't fit the client's buffer (512 bytes,
//! or its EDNS0 size) are truncated with the `TC` bit set.

mod handlers;
pub mod server;

pub use server::{new, DnsServer};

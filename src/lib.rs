//! acme-dns
//!
//! A minimal authoritative DNS server for solving [RFC-8555][RFC-8555] [DNS-01] challenges on
//! behalf of ACME clients, compatible with the [acme-dns] HTTP API.
//!
//! Clients [register][crate::api#register-post] once, `CNAME` their
//! `_acme-challenge.<name>` to the returned `fulldomain`, and then
//! [update][crate::api#update-post] its TXT record whenever they need a certificate. The
//! [DNS server][crate::dns] answers for the configured zone only and never recurses.
//!
//! [acme-dns]: https://github.com/joohoi/acme-dns
//! [RFC-8555]: https://www.rfc-editor.org/rfc/rfc8555
//! [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4
//!
#![warn(clippy::pedantic)]

pub mod acme;
pub mod api;
pub mod config;
pub mod dns;
pub mod error;
pub mod store;
pub mod zone;

pub use api::new as new_http;
pub use config::{Config, SharedConfig};
pub use dns::new as new_dns;
pub use store::{FileBackend, InMemoryBackend, RecordStore, SharedStore};
pub use zone::{SharedZone, Zone};

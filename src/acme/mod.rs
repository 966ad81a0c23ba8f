//! Certificates for the server's own HTTP API.
//!
//! With `"tls": {"mode": "acme", ...}` in the [`Config`][crate::config::Config] the server
//! obtains the API certificate from an ACME directory (Let's Encrypt by default) and answers the
//! [DNS-01] challenges itself: [`SelfChallengeProvider`] writes challenge values into the
//! reserved `_acme-challenge` record, which the [DNS server][crate::dns] is already serving.
//!
//! Certificate names must therefore be the configured domain or its wildcard, whose challenges
//! both live at `_acme-challenge.<domain>`. The record keeps the two most recent values, so an
//! apex plus wildcard order validates in one round.
//!
//! [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4

pub mod certs;
pub mod provider;

pub use certs::{renew_loop, CertManager, IssuedCert};
pub use provider::{ChallengeProvider, SelfChallengeProvider};

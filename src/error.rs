//! Error types.

use axum::extract::rejection::JsonRejection;
use std::net::IpAddr;
use trust_dns_server::proto::error::ProtoError;

/// Error enumerates the possible acme-dns error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when clients `POST` the [`/register` API endpoint][crate::api#register-post]
    /// while registration is disabled in the [`Config`][crate::config::Config].
    #[error("not implemented")]
    NotImplemented,

    /// Returned when a subdomain is not known to the [`RecordStore`][crate::store::RecordStore].
    #[error("subdomain \"{0}\" not found")]
    NotFound(String),

    /// Returned when `X-Api-User`/`X-Api-Key` credentials don't match a registration.
    ///
    /// Deliberately carries no detail: unknown usernames and wrong passwords are
    /// indistinguishable.
    #[error("unauthorized")]
    Unauthorized,

    /// Returned when an authenticated client `POST`s the
    /// [`/update` API endpoint][crate::api#update-post] for a subdomain it doesn't own, or from
    /// a source IP address outside of the registration's `allowfrom` networks.
    #[error("IP {0} is not authorized to update \"{1}\"")]
    AuthForbidden(IpAddr, String),

    /// Returned when clients `POST` invalid JSON.
    #[error(transparent)]
    JsonExtractorRejection(#[from] JsonRejection),

    /// Returned when clients `POST` the  [`/update` API endpoint][crate::api#update-post] with
    /// a `txt` value that isn't shaped like a [RFC-8555][RFC-8555] [DNS-01] challenge response.
    ///
    /// These values MUST be 43 characters of the URL-safe BASE64 alphabet (an unpadded
    /// SHA256 digest).
    ///
    /// [RFC-8555]: https://www.rfc-editor.org/rfc/rfc8555
    /// [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4
    #[error("TXT value is not a valid DNS-01 challenge response")]
    InvalidDNS01,

    /// Returned when a registration request lists an `allowfrom` entry that isn't a CIDR.
    #[error("invalid allowfrom CIDR: \"{0}\"")]
    InvalidAllowFrom(String),

    /// Returned when the persistent record state can't be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Returned when the configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when a static record line in the configuration can't be parsed.
    #[error("invalid static record \"{line}\": {reason}")]
    InvalidRecord { line: String, reason: String },

    /// Returned when an ACME certificate order fails.
    #[error("ACME error: {0}")]
    Acme(String),

    /// Returned when an ACME challenge operation was cancelled by its orchestrator.
    #[error("operation cancelled")]
    Cancelled,

    /// Returned when a TLS certificate or key can't be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON from disk (e.g. when
    /// [trying to load a `Config`][crate::config::Config::try_from_file], or when loading the
    /// [file-backed record state][crate::store::file::FileBackend]) fails due to invalid JSON
    /// content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the DNS server encounters a generic DNS protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),
}

impl From<instant_acme::Error> for Error {
    fn from(err: instant_acme::Error) -> Self {
        Error::Acme(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

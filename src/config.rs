use crate::error::Error;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use trust_dns_server::client::rr::{LowerName, Name};

pub type SharedConfig = Arc<Config>;

const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Cost bounds accepted by bcrypt.
pub const BCRYPT_MIN_COST: u32 = 4;
pub const BCRYPT_MAX_COST: u32 = 31;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub domain: LowerName,
    pub ns_domain: LowerName,
    pub ns_admin: String,
    #[serde(default)]
    pub records: Vec<String>,
    /// Directory holding one JSON document per registered subdomain. Unset keeps records in
    /// memory only.
    pub store_state_path: Option<String>,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
    pub api_bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub api_timeout: Duration,
    #[serde(default)]
    pub disable_registration: bool,
    pub use_header: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    pub dns_bind_addrs: Vec<SocketAddr>,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub dns_protocol: DnsProtocol,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_tcp_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_dns_query_timeout")]
    pub dns_query_timeout: Duration,
}

/// How the HTTP API listener obtains (or doesn't) its TLS certificate.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TlsConfig {
    #[default]
    None,
    Cert {
        cert_path: String,
        key_path: String,
    },
    Acme(AcmeConfig),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AcmeConfig {
    /// `letsencrypt`, `letsencryptstaging`, or an ACME directory URL.
    #[serde(default = "default_acme_directory")]
    pub directory: String,
    pub contact: Option<String>,
    pub cache_dir: String,
    /// Certificate names. Defaults to the configured domain.
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &str {
        match self.directory.as_str() {
            "letsencrypt" => LETSENCRYPT_PRODUCTION,
            "letsencryptstaging" => LETSENCRYPT_STAGING,
            url => url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Any,
    V4,
    V6,
}

/// DNS listener protocol mode, written as `udp`, `tcp` or `both`, optionally suffixed with `4`
/// or `6` to restrict the listeners to one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsProtocol {
    pub transport: Transport,
    pub family: AddrFamily,
}

impl Default for DnsProtocol {
    fn default() -> Self {
        DnsProtocol {
            transport: Transport::Both,
            family: AddrFamily::Any,
        }
    }
}

impl DnsProtocol {
    pub fn udp(&self) -> bool {
        matches!(self.transport, Transport::Udp | Transport::Both)
    }

    pub fn tcp(&self) -> bool {
        matches!(self.transport, Transport::Tcp | Transport::Both)
    }

    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self.family {
            AddrFamily::Any => true,
            AddrFamily::V4 => addr.is_ipv4(),
            AddrFamily::V6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for DnsProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (transport, family) = match lower.strip_suffix('4') {
            Some(rest) => (rest, AddrFamily::V4),
            None => match lower.strip_suffix('6') {
                Some(rest) => (rest, AddrFamily::V6),
                None => (lower.as_str(), AddrFamily::Any),
            },
        };
        let transport = match transport {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            "both" => Transport::Both,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "unknown dns_protocol \"{s}\""
                )))
            }
        };
        Ok(DnsProtocol { transport, family })
    }
}

impl fmt::Display for DnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Both => "both",
        };
        let family = match self.family {
            AddrFamily::Any => "",
            AddrFamily::V4 => "4",
            AddrFamily::V6 => "6",
        };
        write!(f, "{transport}{family}")
    }
}

fn default_bcrypt_cost() -> u32 {
    10
}

fn default_dns_query_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_acme_directory() -> String {
    "letsencrypt".to_string()
}

fn default_renew_before_days() -> u32 {
    30
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn try_from_json(json: &str) -> Result<Self, Error> {
        let conf: Config = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn ns_admin(&self) -> Result<Name, Error> {
        Ok(Name::from_str(&self.sanitized_ns_admin())?)
    }

    /// The names the HTTP API certificate is issued for.
    pub fn acme_names(&self, acme: &AcmeConfig) -> Vec<String> {
        if acme.names.is_empty() {
            vec![self.domain.to_string().trim_end_matches('.').to_string()]
        } else {
            acme.names.clone()
        }
    }

    fn sanitized_ns_admin(&self) -> Cow<str> {
        match self.ns_admin.split_once('@') {
            Some((user, domain)) => {
                let user = user.replace('.', "\\.");
                Cow::Owned(format!("{user}.{domain}"))
            }
            _ => Cow::Borrowed(&self.ns_admin),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if Name::from(&self.domain).num_labels() == 0 {
            return Err(Error::InvalidConfig("domain must not be the root".into()));
        }
        if Name::from(&self.ns_domain).num_labels() == 0 {
            return Err(Error::InvalidConfig("ns_domain must not be the root".into()));
        }
        self.ns_admin()?;
        if self.dns_bind_addrs.is_empty() {
            return Err(Error::InvalidConfig("dns_bind_addrs is empty".into()));
        }
        if let Some(addr) = self
            .dns_bind_addrs
            .iter()
            .find(|addr| !self.dns_protocol.accepts(addr))
        {
            return Err(Error::InvalidConfig(format!(
                "dns bind address {addr} doesn't match dns_protocol \"{}\"",
                self.dns_protocol
            )));
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&self.bcrypt_cost) {
            return Err(Error::InvalidConfig(format!(
                "bcrypt_cost must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}"
            )));
        }
        if let Some(header) = &self.use_header {
            axum::http::HeaderName::from_str(header)
                .map_err(|_| Error::InvalidConfig(format!("invalid use_header \"{header}\"")))?;
        }
        if let TlsConfig::Acme(acme) = &self.tls {
            // Every name's challenge must land on our own _acme-challenge record.
            let apex = self.domain.to_string();
            let apex = apex.trim_end_matches('.');
            for name in self.acme_names(acme) {
                let name = name.trim_end_matches('.');
                let bare = name.strip_prefix("*.").unwrap_or(name);
                if !bare.eq_ignore_ascii_case(apex) {
                    return Err(Error::InvalidConfig(format!(
                        "certificate name \"{name}\" must be {apex} or *.{apex}"
                    )));
                }
            }
        }
        Ok(())
    }
}

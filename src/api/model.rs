use crate::store::SubdomainRecord;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const DNS01_ENCODED_LEN: usize = 43;

#[derive(Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub(super) struct RegisterRequest {
    #[serde(default)]
    pub allowfrom: Vec<String>,
}

impl RegisterRequest {
    /// Parse the requested CIDR ranges. A bare address is taken as a single host.
    pub fn allow_from(&self) -> Result<Vec<IpNetwork>, String> {
        self.allowfrom
            .iter()
            .map(|cidr| IpNetwork::from_str(cidr.trim()).map_err(|_| cidr.clone()))
            .collect()
    }
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
pub(super) struct RegisterResponse {
    pub username: String,
    pub password: String,
    pub fulldomain: String,
    pub subdomain: String,
    pub allowfrom: Vec<String>,
}

impl RegisterResponse {
    pub fn new(record: SubdomainRecord, password: String, fulldomain: String) -> Self {
        RegisterResponse {
            username: record.username,
            password,
            fulldomain,
            subdomain: record.subdomain,
            allowfrom: record.allow_from.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, Ord, PartialOrd, Eq, PartialEq)]
pub(super) struct UpdateRecordRequest {
    pub subdomain: String,
    pub txt: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TxtValidationError {
    #[error("invalid length: found {actual} characters, expected {expected}")]
    InvalidLength { actual: usize, expected: usize },
    #[error("invalid character {0:?}")]
    InvalidCharacter(char),
}

impl UpdateRecordRequest {
    /// A DNS-01 value is the unpadded base64url SHA-256 digest of a key authorization: always
    /// 43 characters of the URL-safe alphabet.
    pub fn valid_dns01(&self) -> Result<(), TxtValidationError> {
        if self.txt.len() != DNS01_ENCODED_LEN {
            return Err(TxtValidationError::InvalidLength {
                actual: self.txt.chars().count(),
                expected: DNS01_ENCODED_LEN,
            });
        }
        match self
            .txt
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            Some(c) => Err(TxtValidationError::InvalidCharacter(c)),
            None => Ok(()),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, Ord, PartialOrd, Eq, PartialEq)]
pub(super) struct UpdateRecordResult {
    pub txt: String,
}

//! Desired X.509 subjects for issued credentials.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use rcgen::{DistinguishedName, DnType, SanType};
use serde::{Deserialize, Serialize};

/// A single subject alternative name.
///
/// Only DNS names and IP addresses are issued; ordering is derived so a
/// `BTreeSet<SanEntry>` compares independently of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

impl SanEntry {
    pub(crate) fn to_rcgen(&self) -> SanType {
        match self {
            SanEntry::Dns(name) => SanType::DnsName(name.clone()),
            SanEntry::Ip(ip) => SanType::IpAddress(*ip),
        }
    }
}

impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) => write!(f, "DNS:{}", name),
            SanEntry::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// Subject of a certificate about to be issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub common_name: String,
    pub organization: Option<String>,
    pub subject_alt_names: BTreeSet<SanEntry>,
}

impl Subject {
    pub fn builder(common_name: impl Into<String>) -> SubjectBuilder {
        SubjectBuilder::new(common_name)
    }

    pub(crate) fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, org.clone());
        }
        dn.push(DnType::CommonName, self.common_name.clone());
        dn
    }

    pub(crate) fn rcgen_sans(&self) -> Vec<SanType> {
        self.subject_alt_names.iter().map(SanEntry::to_rcgen).collect()
    }
}

/// Builder for [`Subject`].
///
/// Strings that parse as IP addresses passed to [`SubjectBuilder::with_name`]
/// are recorded as IP SANs, everything else as DNS names. Duplicates collapse.
#[derive(Debug, Clone)]
pub struct SubjectBuilder {
    common_name: String,
    organization: Option<String>,
    sans: BTreeSet<SanEntry>,
}

impl SubjectBuilder {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            sans: BTreeSet::new(),
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_dns_name(mut self, name: impl Into<String>) -> Self {
        self.sans.insert(SanEntry::Dns(name.into()));
        self
    }

    pub fn with_dns_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sans
            .extend(names.into_iter().map(|name| SanEntry::Dns(name.into())));
        self
    }

    pub fn with_ip_address(mut self, ip: IpAddr) -> Self {
        self.sans.insert(SanEntry::Ip(ip));
        self
    }

    pub fn with_name(self, name: &str) -> Self {
        match name.parse::<IpAddr>() {
            Ok(ip) => self.with_ip_address(ip),
            Err(_) => self.with_dns_name(name),
        }
    }

    pub fn build(self) -> Subject {
        Subject {
            common_name: self.common_name,
            organization: self.organization,
            subject_alt_names: self.sans,
        }
    }
}

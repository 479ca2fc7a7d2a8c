use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Addressing convention used by a distributed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameDomain {
    /// `-sname`: the host part is a plain hostname without dots.
    Shortnames,
    /// `-name`: the host part is fully qualified (or an IP address).
    Longnames,
}

impl NameDomain {
    /// Infers the domain from a host, the way the runtime does when only a
    /// node name is known.
    pub fn of_host(host: &str) -> Self {
        if host.contains('.') {
            NameDomain::Longnames
        } else {
            NameDomain::Shortnames
        }
    }

    /// Host used for node names created by the adapter itself.
    pub fn local_host(self) -> &'static str {
        match self {
            NameDomain::Shortnames => "localhost",
            NameDomain::Longnames => "127.0.0.1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NameDomain::Shortnames => "shortnames",
            NameDomain::Longnames => "longnames",
        }
    }
}

impl fmt::Display for NameDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node name `{0}` is missing `@host`")]
    MissingHost(String),
    #[error("node name `{0}` has an empty name or host part")]
    EmptyPart(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("node `{node}` is not a valid {domain} node name: {reason}")]
pub struct NameDomainMismatch {
    pub node: NodeId,
    pub domain: NameDomain,
    pub reason: &'static str,
}

/// A runtime node address, `name@host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    name: String,
    host: String,
}

impl NodeId {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }

    /// The alive name, as registered with the port mapper.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Checks the host part against the addressing convention. This never
    /// performs I/O.
    pub fn check_domain(&self, domain: NameDomain) -> Result<(), NameDomainMismatch> {
        let dotted = self.host.contains('.');
        let reason = match domain {
            NameDomain::Shortnames if dotted => "short names must not contain a dotted host",
            NameDomain::Longnames if !dotted => "long names require a fully qualified host",
            _ => return Ok(()),
        };

        Err(NameDomainMismatch {
            node: self.clone(),
            domain,
            reason,
        })
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, host) = s
            .split_once('@')
            .ok_or_else(|| NodeIdError::MissingHost(s.to_string()))?;

        if name.is_empty() || host.is_empty() {
            return Err(NodeIdError::EmptyPart(s.to_string()));
        }

        Ok(NodeId::new(name, host))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

//! Peer URIs and address classification.
//!
//! Peers are addressed as `quic://host:port` with no path and no query.
//! The host is an IPv4 literal, a bracketed IPv6 literal or a domain name
//! that is resolved through the system resolver at dial time.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use url::Url;

use crate::error::{SetupError, SetupResult};

/// The only URI scheme accepted for peers.
pub const PEER_SCHEME: &str = "quic";

/// What kind of host a URI names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Domain,
    Unknown,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Ipv4 => write!(f, "ipv4"),
            AddressType::Ipv6 => write!(f, "ipv6"),
            AddressType::Domain => write!(f, "domain"),
            AddressType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a bare host string (no brackets, no port).
pub fn identify_address_type(host: &str) -> AddressType {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => AddressType::Ipv4,
        Ok(IpAddr::V6(_)) => AddressType::Ipv6,
        Err(_) if is_domain(host) => AddressType::Domain,
        Err(_) => AddressType::Unknown,
    }
}

/// `localhost`, or dot-separated labels ending in an alphabetic TLD.
fn is_domain(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || host.len() > 253 {
        return false;
    }

    let valid_label = |label: &str| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 63
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
            && bytes[0] != b'-'
            && bytes[bytes.len() - 1] != b'-'
    };
    let (tld, rest) = match labels.split_last() {
        Some(split) => split,
        None => return false,
    };
    tld.len() >= 2
        && tld.bytes().all(|b| b.is_ascii_alphabetic())
        && rest.iter().all(|label| valid_label(label))
}

/// A validated `quic://host:port` peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    host: String,
    port: u16,
    kind: AddressType,
}

impl PeerUri {
    /// Parse and validate `uri`.
    pub fn parse(uri: &str) -> SetupResult<Self> {
        let url = Url::parse(uri).map_err(|e| SetupError::InvalidUri(format!("{}: {}", uri, e)))?;

        if url.scheme() != PEER_SCHEME {
            return Err(SetupError::UnsupportedScheme(url.scheme().to_string()));
        }

        let raw_host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(SetupError::InvalidUri(format!("{}: no host", uri))),
        };
        let port = url
            .port()
            .ok_or_else(|| SetupError::InvalidUri(format!("{}: no port", uri)))?;
        if !url.path().is_empty() {
            return Err(SetupError::InvalidUri(format!("{}: path must be empty", uri)));
        }
        if url.query().is_some() {
            return Err(SetupError::InvalidUri(format!(
                "{}: query parameters are not allowed",
                uri
            )));
        }
        if url.fragment().is_some() {
            return Err(SetupError::InvalidUri(format!("{}: fragments are not allowed", uri)));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(SetupError::InvalidUri(format!("{}: credentials are not allowed", uri)));
        }

        let host = raw_host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(raw_host)
            .to_string();
        let kind = identify_address_type(&host);
        if kind == AddressType::Unknown {
            return Err(SetupError::UnresolvableHost(host));
        }

        Ok(Self { host, port, kind })
    }

    /// Host without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> AddressType {
        self.kind
    }

    /// Name presented for TLS server name indication.
    pub fn server_name(&self) -> &str {
        &self.host
    }

    /// Socket address to dial. Domains take the first resolved address.
    pub async fn resolve(&self) -> SetupResult<SocketAddr> {
        match self.kind {
            AddressType::Ipv4 | AddressType::Ipv6 => {
                let ip: IpAddr = self
                    .host
                    .parse()
                    .map_err(|_| SetupError::UnresolvableHost(self.host.clone()))?;
                Ok(SocketAddr::new(ip, self.port))
            }
            AddressType::Domain => {
                let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
                    .await
                    .map_err(|e| {
                        tracing::debug!(host = %self.host, error = %e, "DNS lookup failed");
                        SetupError::UnresolvableHost(self.host.clone())
                    })?;
                addrs
                    .next()
                    .ok_or_else(|| SetupError::UnresolvableHost(self.host.clone()))
            }
            AddressType::Unknown => Err(SetupError::UnresolvableHost(self.host.clone())),
        }
    }
}

impl fmt::Display for PeerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressType::Ipv6 => write!(f, "{}://[{}]:{}", PEER_SCHEME, self.host, self.port),
            _ => write!(f, "{}://{}:{}", PEER_SCHEME, self.host, self.port),
        }
    }
}

/// Parse a local bind address. Only IP literals are accepted.
pub fn parse_local_address(addr: &str) -> SetupResult<SocketAddr> {
    addr.parse::<SocketAddr>()
        .map_err(|_| SetupError::InvalidLocalAddress(addr.to_string()))
}

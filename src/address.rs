//! Compound addresses of application entities:
//! an optional AE title plus a host and port,
//! written as `{ae_title}@{host}:{port}`.
//!
//! Unlike a bare socket address, the host part may be a DNS name;
//! resolution happens when the connection is opened.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use snafu::{OptionExt, Snafu};

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingAeTitle,

    /// Missing `:` between host and port
    MissingPort,

    /// Could not parse port number
    InvalidPort { source: std::num::ParseIntError },
}

fn split_host_port(s: &str) -> Result<(String, u16), ParseAeAddressError> {
    let (host, port) = s.rsplit_once(':').context(MissingPortSnafu)?;
    let port = port.parse().map_err(|source| ParseAeAddressError::InvalidPort { source })?;
    Ok((host.to_string(), port))
}

/// A full application entity address:
/// AE title, host, and port, all mandatory.
///
/// # Example
///
/// ```
/// # use dicom_association::address::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "STORE-SCP@pacs.example.org:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert_eq!(addr.host(), "pacs.example.org");
/// assert_eq!(addr.port(), 104);
/// assert_eq!(&addr.to_string(), "STORE-SCP@pacs.example.org:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FullAeAddr {
    ae_title: String,
    host: String,
    port: u16,
}

impl FullAeAddr {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, rest) = s.split_once('@').context(MissingAeTitleSnafu)?;
        let (host, port) = split_host_port(rest)?;
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            host,
            port,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// An application entity address whose AE title part is optional.
///
/// # Example
///
/// ```
/// # use dicom_association::address::{AeAddr, FullAeAddr};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "192.168.1.99:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// let full: FullAeAddr = addr.with_default_ae_title("ANY-SCP");
/// assert_eq!(full.ae_title(), "ANY-SCP");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    host: String,
    port: u16,
}

impl AeAddr {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            host: host.into(),
            port,
        }
    }

    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Promote to a full address, replacing any existing AE title.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: ae_title.into(),
            host: self.host,
            port: self.port,
        }
    }

    /// Promote to a full address,
    /// using the given AE title only when none is present.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            host: self.host,
            port: self.port,
        }
    }
}

impl From<FullAeAddr> for AeAddr {
    fn from(full: FullAeAddr) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            host: full.host,
            port: full.port,
        }
    }
}

impl From<SocketAddr> for AeAddr {
    fn from(addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, rest) = match s.split_once('@') {
            Some((ae_title, rest)) => (Some(ae_title.to_string()), rest),
            None => (None, s),
        };
        let (host, port) = split_host_port(rest)?;
        Ok(AeAddr {
            ae_title,
            host,
            port,
        })
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn parse_full_address() {
        let addr: FullAeAddr = "STORE-SCP@localhost:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 11112);

        assert_matches!(
            "localhost:11112".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingAeTitle)
        );
        assert_matches!(
            "SCP@localhost".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPort)
        );
    }

    #[test]
    fn parse_optional_title() {
        let addr: AeAddr = "10.0.0.4:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.to_string(), "10.0.0.4:104");

        let full = addr.with_ae_title("PACS");
        assert_eq!(full.to_string(), "PACS@10.0.0.4:104");
    }
}

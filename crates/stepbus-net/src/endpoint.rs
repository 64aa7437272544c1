//! Transport-independent endpoints and IPv4 addressing.

use crate::NetError;

/// A transport-independent endpoint: a transport name plus an address whose
/// form the transport defines. Canonical URL form is `transport://address`.
///
/// Only the `tcp` transport is supported by the sockets in this crate; the
/// type itself does not restrict the transport name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    transport: String,
    address: String,
}

impl Endpoint {
    /// Creates an endpoint from a transport and an address.
    pub fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self { transport: transport.into(), address: address.into() }
    }

    /// Parses an endpoint from its URL form `transport://address`.
    pub fn from_url(url: &str) -> Result<Self, NetError> {
        let Some((transport, address)) = url.split_once("://") else {
            return Err(NetError::InvalidEndpoint {
                input: url.to_string(),
                reason: "missing \"://\" separator",
            });
        };
        if transport.is_empty() {
            return Err(NetError::InvalidEndpoint {
                input: url.to_string(),
                reason: "empty transport",
            });
        }
        Ok(Self::new(transport, address))
    }

    /// The transport name, e.g. `tcp`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The transport-specific address, e.g. `127.0.0.1:50301`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The canonical URL form `transport://address`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.transport, self.address)
    }

    /// Interprets this endpoint's address as an IPv4/hostname endpoint.
    ///
    /// Fails if the transport is not `tcp` or the address does not parse.
    pub fn to_ip(&self) -> Result<ip::Endpoint, NetError> {
        if self.transport != "tcp" {
            return Err(NetError::UnsupportedTransport(self.transport.clone()));
        }
        self.address.parse()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

/// The network locations at which one slave is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveLocator {
    /// The slave's control (request/reply) endpoint.
    pub control: Endpoint,
    /// The slave's variable-publish endpoint.
    pub data_pub: Endpoint,
}

/// Internet addressing: IPv4 addresses, port numbers and `host:port`
/// endpoints, with the `*` wildcard meaning "all interfaces" or "any port".
pub mod ip {
    use std::net::{Ipv4Addr, SocketAddr};

    use crate::NetError;

    /// An internet host: an IPv4 address, a name to be resolved, or the
    /// special value `*` meaning all local interfaces.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum Address {
        /// All local interfaces (`*`, i.e. 0.0.0.0 when binding).
        Any,
        /// A literal IPv4 address.
        Ip(Ipv4Addr),
        /// A host name, resolved by the OS at connect time.
        Name(String),
    }

    impl std::fmt::Display for Address {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Any => f.write_str("*"),
                Self::Ip(ip) => write!(f, "{ip}"),
                Self::Name(name) => f.write_str(name),
            }
        }
    }

    impl std::str::FromStr for Address {
        type Err = NetError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s.is_empty() {
                return Err(NetError::InvalidEndpoint {
                    input: s.to_string(),
                    reason: "empty address",
                });
            }
            if s == "*" {
                return Ok(Self::Any);
            }
            match s.parse::<Ipv4Addr>() {
                Ok(ip) => Ok(Self::Ip(ip)),
                Err(_) => Ok(Self::Name(s.to_string())),
            }
        }
    }

    /// An internet port: a number, or `*` meaning "OS-assigned".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Port {
        /// Let the OS pick an ephemeral port.
        Any,
        /// A specific port number.
        Number(u16),
    }

    impl Port {
        /// The port number, if this is not the wildcard.
        pub fn number(self) -> Option<u16> {
            match self {
                Self::Any => None,
                Self::Number(n) => Some(n),
            }
        }

        /// The number to pass when binding: 0 requests an ephemeral port.
        pub fn bind_number(self) -> u16 {
            self.number().unwrap_or(0)
        }
    }

    impl std::fmt::Display for Port {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Any => f.write_str("*"),
                Self::Number(n) => write!(f, "{n}"),
            }
        }
    }

    impl std::str::FromStr for Port {
        type Err = NetError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s == "*" {
                return Ok(Self::Any);
            }
            s.parse::<u16>().map(Self::Number).map_err(|_| NetError::InvalidEndpoint {
                input: s.to_string(),
                reason: "port is not a number in 0-65535",
            })
        }
    }

    /// A `host:port` endpoint.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Endpoint {
        /// The host part.
        pub address: Address,
        /// The port part.
        pub port: Port,
    }

    impl Endpoint {
        /// Creates an endpoint from an address and a port.
        pub fn new(address: Address, port: Port) -> Self {
            Self { address, port }
        }

        /// Wraps this endpoint in a transport-level [`super::Endpoint`].
        pub fn to_endpoint(&self, transport: &str) -> super::Endpoint {
            super::Endpoint::new(transport, self.to_string())
        }

        /// The `host:port` string to bind a listener to. The wildcard
        /// address binds all interfaces; the wildcard port requests an
        /// ephemeral port.
        pub fn bind_addr(&self) -> String {
            let host = match &self.address {
                Address::Any => "0.0.0.0".to_string(),
                Address::Ip(ip) => ip.to_string(),
                Address::Name(name) => name.clone(),
            };
            format!("{host}:{}", self.port.bind_number())
        }

        /// The `host:port` string to connect to. Wildcards cannot be
        /// connected to.
        pub fn connect_addr(&self) -> Result<String, NetError> {
            let port = self.port.number().ok_or_else(|| NetError::InvalidEndpoint {
                input: self.to_string(),
                reason: "cannot connect to a wildcard port",
            })?;
            let host = match &self.address {
                Address::Any => {
                    return Err(NetError::InvalidEndpoint {
                        input: self.to_string(),
                        reason: "cannot connect to the wildcard address",
                    });
                }
                Address::Ip(ip) => ip.to_string(),
                Address::Name(name) => name.clone(),
            };
            Ok(format!("{host}:{port}"))
        }
    }

    impl From<SocketAddr> for Endpoint {
        fn from(addr: SocketAddr) -> Self {
            let address = match addr {
                SocketAddr::V4(v4) => Address::Ip(*v4.ip()),
                SocketAddr::V6(v6) => Address::Name(v6.ip().to_string()),
            };
            Self { address, port: Port::Number(addr.port()) }
        }
    }

    impl std::fmt::Display for Endpoint {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}:{}", self.address, self.port)
        }
    }

    impl std::str::FromStr for Endpoint {
        type Err = NetError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            // The port is optional and defaults to the wildcard.
            match s.rsplit_once(':') {
                Some((host, port)) => Ok(Self { address: host.parse()?, port: port.parse()? }),
                None => Ok(Self { address: s.parse()?, port: Port::Any }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ip::{Address, Port};
    use super::*;

    #[test]
    fn url_round_trip() {
        let ep = Endpoint::from_url("tcp://127.0.0.1:5000").unwrap();
        assert_eq!(ep.transport(), "tcp");
        assert_eq!(ep.address(), "127.0.0.1:5000");
        assert_eq!(ep.url(), "tcp://127.0.0.1:5000");
    }

    #[test]
    fn url_without_separator_is_rejected() {
        assert!(Endpoint::from_url("localhost:5000").is_err());
        assert!(Endpoint::from_url("://x").is_err());
    }

    #[test]
    fn ip_endpoint_parsing() {
        let ep: ip::Endpoint = "127.0.0.1:80".parse().unwrap();
        assert_eq!(ep.address, Address::Ip("127.0.0.1".parse().unwrap()));
        assert_eq!(ep.port, Port::Number(80));

        let any: ip::Endpoint = "*:*".parse().unwrap();
        assert_eq!(any.address, Address::Any);
        assert_eq!(any.port, Port::Any);

        let named: ip::Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(named.address, Address::Name("example.com".into()));
    }

    #[test]
    fn missing_port_defaults_to_wildcard() {
        let ep: ip::Endpoint = "10.0.0.1".parse().unwrap();
        assert_eq!(ep.port, Port::Any);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        assert!("host:65536".parse::<ip::Endpoint>().is_err());
        assert!("host:port".parse::<ip::Endpoint>().is_err());
    }

    #[test]
    fn bind_and_connect_strings() {
        let ep: ip::Endpoint = "*:*".parse().unwrap();
        assert_eq!(ep.bind_addr(), "0.0.0.0:0");
        assert!(ep.connect_addr().is_err());

        let ep: ip::Endpoint = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(ep.bind_addr(), "127.0.0.1:9001");
        assert_eq!(ep.connect_addr().unwrap(), "127.0.0.1:9001");
    }

    #[test]
    fn transport_endpoint_to_ip() {
        let ep = Endpoint::new("tcp", "*:0");
        assert!(ep.to_ip().is_ok());

        let ep = Endpoint::new("ipc", "/tmp/sock");
        assert!(matches!(ep.to_ip(), Err(NetError::UnsupportedTransport(_))));
    }
}

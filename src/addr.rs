use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A thin newtype over `std::net::SocketAddr`. No address parsing of its
/// own; `new` just forwards to `IpAddr::from_str` and reports a bad literal
/// as an `io::Error` rather than panicking, since it can be reached with
/// attacker-controlled strings (e.g. a peer-forwarded address).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InetAddress(SocketAddr);

impl InetAddress {
    pub fn new(ip: &str, port: u16) -> io::Result<InetAddress> {
        let ip = IpAddr::from_str(ip)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(InetAddress(SocketAddr::new(ip, port)))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_ip_port(&self) -> String {
        format!("{}:{}", self.0.ip(), self.0.port())
    }

    pub fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(addr: SocketAddr) -> InetAddress {
        InetAddress(addr)
    }
}

impl From<InetAddress> for SocketAddr {
    fn from(addr: InetAddress) -> SocketAddr {
        addr.0
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::InetAddress;

    #[test]
    fn builds_from_ip_and_port() {
        let addr = InetAddress::new("127.0.0.1", 9000).unwrap();
        assert_eq!(addr.port(), 9000);
        assert_eq!(addr.to_ip_port(), "127.0.0.1:9000");
    }

    #[test]
    fn rejects_bad_literal() {
        assert!(InetAddress::new("not-an-ip", 9000).is_err());
    }
}

use std::fmt;
use std::net::SocketAddr;

/// A channel endpoint address, spanning every transport this core supports.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelAddress {
    Socket(SocketAddr),
    /// A process-local endpoint name, used by the in-process transport.
    Local(String),
    /// An unresolved host/port pair; a [`crate::resolver::NameResolver`]
    /// turns this into a `Socket` address before a transport ever sees it.
    Host { host: String, port: u16 },
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Socket(addr) => write!(f, "{addr}"),
            ChannelAddress::Local(name) => write!(f, "local:{name}"),
            ChannelAddress::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl From<SocketAddr> for ChannelAddress {
    fn from(addr: SocketAddr) -> Self {
        ChannelAddress::Socket(addr)
    }
}

use once_cell::sync::Lazy;
use std::fmt;
use std::net::UdpSocket;

static CONSUMER_NAME: Lazy<String> =
    Lazy::new(|| ConsumerIdentity::new(host_address(), std::process::id()).to_string());

/// Broker-visible consumer name of this process: `<host-address>@<pid>`
///
/// Computed once and stable for the life of the process.
pub fn consumer_name() -> &'static str {
    &CONSUMER_NAME
}

/// Identity of one consumer within a group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerIdentity {
    pub host: String,
    pub pid: u32,
}

impl ConsumerIdentity {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.host, self.pid)
    }
}

/// Address of the outbound interface; connecting a UDP socket sends nothing
fn host_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

//! Bus addresses: `<transport>:<key>=<value>,<key>=<value>,...`
//!
//! Values are `%xx` escaped, several addresses may be separated by `;`.

use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, Result};

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    params: Vec<(String, String)>,
}

fn invalid(address: &str) -> crate::Error {
    context!(ErrorKind::InvalidAddress(address.to_string()))
}

fn unescape(address: &str, s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or_else(|| invalid(address))?;
            let hex = std::str::from_utf8(hex).map_err(|_| invalid(address))?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid(address))?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid(address))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

impl BusAddress {
    pub fn new<S: Into<String>>(transport: S) -> Self {
        BusAddress {
            transport: transport.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Parses a single address.
    pub fn parse(address: &str) -> Result<BusAddress> {
        let (transport, rest) = address.split_once(':').ok_or_else(|| invalid(address))?;
        if transport.is_empty() {
            return Err(invalid(address));
        }

        let mut params = Vec::new();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key, unescape(address, value)?),
                None => (pair, "true".to_string()),
            };
            if key.is_empty() {
                return Err(invalid(address));
            }
            params.push((key.to_string(), value));
        }

        Ok(BusAddress {
            transport: transport.to_string(),
            params,
        })
    }

    /// Parses a `;` separated list of addresses, to be tried in order.
    pub fn parse_list(addresses: &str) -> Result<Vec<BusAddress>> {
        let list = addresses
            .split(';')
            .filter(|a| !a.is_empty())
            .map(BusAddress::parse)
            .collect::<Result<Vec<_>>>()?;
        if list.is_empty() {
            return Err(invalid(addresses));
        }
        Ok(list)
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `listen=true` selects the server role.
    pub fn is_listen(&self) -> bool {
        self.get("listen") == Some("true")
    }

    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    pub(crate) fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            context!(ErrorKind::InvalidAddress(format!(
                "{}: missing '{}'",
                self, key
            )))
        })
    }
}

impl FromStr for BusAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<BusAddress> {
        BusAddress::parse(s)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, escape(v))?;
        }
        Ok(())
    }
}

/// The session bus addresses from the environment.
pub fn session_bus_address() -> Result<Vec<BusAddress>> {
    match env::var(SESSION_BUS_ENV) {
        Ok(addr) => BusAddress::parse_list(&addr),
        Err(_) => Err(context!(ErrorKind::InvalidAddress(format!(
            "{} is not set",
            SESSION_BUS_ENV
        )))),
    }
}

/// The system bus addresses, falling back to the well known socket.
pub fn system_bus_address() -> Result<Vec<BusAddress>> {
    match env::var(SYSTEM_BUS_ENV) {
        Ok(addr) => BusAddress::parse_list(&addr),
        Err(_) => BusAddress::parse_list(DEFAULT_SYSTEM_BUS_ADDRESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let a = BusAddress::parse("tcp:host=localhost,port=4000,listen=true").unwrap();
        assert_eq!(a.transport(), "tcp");
        assert_eq!(a.get("host"), Some("localhost"));
        assert_eq!(a.get("port"), Some("4000"));
        assert!(a.is_listen());
        assert_eq!(a.get("family"), None);
    }

    #[test]
    fn test_unescape() {
        let a = BusAddress::parse("unix:path=/tmp/with%20space%2cx,guid=0123").unwrap();
        assert_eq!(a.get("path"), Some("/tmp/with space,x"));
        assert_eq!(a.guid(), Some("0123"));
        assert_eq!(a.to_string(), "unix:path=/tmp/with%20space%2cx,guid=0123");

        assert!(BusAddress::parse("unix:path=%zz").is_err());
        assert!(BusAddress::parse("unix:path=%2").is_err());
    }

    #[test]
    fn test_bare_key() {
        let a = BusAddress::parse("tcp:host=h,port=1,listen").unwrap();
        assert!(a.is_listen());
    }

    #[test]
    fn test_invalid() {
        for bad in &["", "nocolon", ":path=/x", "unix:=x"] {
            let e = BusAddress::parse(bad).unwrap_err();
            assert!(matches!(e.kind(), ErrorKind::InvalidAddress(_)), "{}", bad);
        }
    }

    #[test]
    fn test_list() {
        let list =
            BusAddress::parse_list("unix:abstract=/tmp/dbus-XXXX;tcp:host=localhost,port=4000")
                .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].get("abstract"), Some("/tmp/dbus-XXXX"));
        assert_eq!(list[1].transport(), "tcp");
        assert!(BusAddress::parse_list(";").is_err());
    }
}

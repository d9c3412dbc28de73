use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::address::BusAddress;
use crate::error::*;

/// A connected duplex byte stream with blocking reads and writes.
pub trait Stream: Read + Write + Send + Sync + AsRawFd {
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)>;
    fn shutdown(&mut self) -> Result<()>;
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>>;
}

impl Stream for TcpStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(TcpStream::try_clone(self).map_err(map_context!())?),
            Box::new(TcpStream::try_clone(self).map_err(map_context!())?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }
}

impl Stream for UnixStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(UnixStream::try_clone(self).map_err(map_context!())?),
            Box::new(UnixStream::try_clone(self).map_err(map_context!())?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> ::std::io::Result<Box<dyn Stream>> {
        Ok(Box::new(UnixStream::try_clone(self)?))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name).map_err(map_context!())?;
    UnixStream::connect_addr(&addr).map_err(map_context!())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(context!(ErrorKind::InvalidAddress(format!(
        "abstract sockets are not supported: {}",
        name
    ))))
}

/// Opens the transport named by a client address.
pub fn connect(address: &BusAddress) -> Result<Box<dyn Stream>> {
    debug!("connecting to {}", address);
    match address.transport() {
        "tcp" => {
            let host = address.get("host").unwrap_or("localhost");
            let port: u16 = address
                .require("port")?
                .parse()
                .map_err(|_| context!(ErrorKind::InvalidAddress(address.to_string())))?;
            let stream = TcpStream::connect((host, port)).map_err(map_context!())?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        "unix" => {
            if let Some(path) = address.get("path") {
                Ok(Box::new(UnixStream::connect(path).map_err(map_context!())?))
            } else if let Some(name) = address.get("abstract") {
                Ok(Box::new(connect_abstract(name)?))
            } else {
                Err(context!(ErrorKind::InvalidAddress(format!(
                    "{}: need 'path' or 'abstract'",
                    address
                ))))
            }
        }
        _ => Err(context!(ErrorKind::InvalidAddress(address.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_unknown_transport() {
        let a = BusAddress::parse("launchd:env=FOO").unwrap();
        assert!(matches!(
            connect(&a).err().map(|e| e.kind().clone()),
            Some(ErrorKind::InvalidAddress(_))
        ));
        let a = BusAddress::parse("unix:tmpdir=/tmp").unwrap();
        assert!(connect(&a).is_err());
    }

    #[test]
    fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let a = BusAddress::new("unix")
            .with_param("path", dir.path().join("nope").to_string_lossy());
        assert!(connect(&a).is_err());
    }
}

use anyhow::{anyhow, Context, Result};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use crate::protocol::Deadlines;

// Socket tuning: enlarge buffers and disable Nagle for throughput
pub fn tune_socket(stream: &TcpStream, bytes: usize) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let sz: libc::c_int = bytes.min(libc::c_int::MAX as usize) as libc::c_int;
        let p = &sz as *const _ as *const libc::c_void;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
        }
    }
    #[cfg(not(unix))]
    let _ = bytes;
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", addr))
}

/// Dial the storage node, honouring the connect deadline, then install the
/// read/write deadlines and socket tuning on the new stream.
pub fn connect(addr: &str, deadlines: &Deadlines, buffer_size: usize) -> Result<TcpStream> {
    let stream = match deadlines.connect {
        Some(d) => {
            let sa = resolve(addr)?;
            TcpStream::connect_timeout(&sa, d).with_context(|| format!("connect {}", addr))?
        }
        None => TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?,
    };
    tune_socket(&stream, buffer_size);
    deadlines.apply(&stream)?;
    Ok(stream)
}

pub fn peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn connect_applies_deadlines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let d = Deadlines::uniform(Duration::from_millis(400));
        let s = connect(&addr, &d, 64 * 1024).unwrap();
        assert_eq!(s.read_timeout().unwrap(), Some(Duration::from_millis(400)));
        assert!(s.nodelay().unwrap());
    }

    #[test]
    fn connect_refused_is_an_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let d = Deadlines::uniform(Duration::from_millis(300));
        assert!(connect(&format!("127.0.0.1:{port}"), &d, 4096).is_err());
    }
}

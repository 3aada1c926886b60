// The MIT License (MIT)

// Copyright (c) 2021 Corio Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! A small JSON RPC server/client on top of the coroutine sockets.
//!
//! Messages are framed with an 8-byte header: two reserved bytes, the
//! magic `0x7777`, and a big-endian body length. Bodies are JSON. The
//! server runs one coroutine per connection; receive buffers are
//! recycled through a per-scheduler [`Pool`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use serde_json::Value;

use crate::hook;
use crate::sock;
use crate::sync::Pool;

const MAGIC: u16 = 0x7777;
const HEADER_LEN: usize = 8;

const MAX_MSG_SIZE: usize = 8 << 20;
const RECV_TIMEOUT_MS: i64 = 1024;
const SEND_TIMEOUT_MS: i64 = 1024;
const CONN_TIMEOUT_MS: i64 = 3000;
/// A connection is dropped when no request arrives for this long.
const CONN_IDLE_MS: i64 = 180 * 1000;

fn encode_header(body_len: usize) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[2..4].copy_from_slice(&MAGIC.to_be_bytes());
    h[4..8].copy_from_slice(&(body_len as u32).to_be_bytes());
    h
}

fn decode_header(h: &[u8; HEADER_LEN]) -> io::Result<usize> {
    let magic = u16::from_be_bytes([h[2], h[3]]);
    if magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad rpc magic"));
    }
    let len = u32::from_be_bytes([h[4], h[5], h[6], h[7]]) as usize;
    if len > MAX_MSG_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "rpc message too large"));
    }
    Ok(len)
}

/// The application side of an RPC server.
pub trait Service: Send + Sync + 'static {
    fn process(&self, req: &Value, res: &mut Value);
}

pub struct Server {
    service: Arc<dyn Service>,
}

impl Server {
    pub fn new<S: Service>(service: S) -> Server {
        Server { service: Arc::new(service) }
    }

    /// Bind and start serving. Returns the bound port, which matters
    /// when `port` is 0. Serving itself happens on coroutines; this
    /// call returns immediately.
    pub fn start(&self, ip: &str, port: u16) -> io::Result<u16> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ip address"))?;
        let addr = SocketAddr::new(ip, port);

        let fd = sock::tcp_socket(addr.is_ipv6())?;
        sock::set_reuseaddr(fd)?;
        sock::bind(fd, &addr)?;
        sock::listen(fd, 1024)?;
        let bound = sock::local_addr(fd)?.port();
        info!("rpc server listening on {}:{}", ip, bound);

        let service = self.service.clone();
        crate::go(move || {
            let buffers: Pool<Vec<u8>> = Pool::with_creator(|| Vec::with_capacity(4096), 128);
            loop {
                match sock::accept(fd) {
                    Ok((conn, peer)) => {
                        debug!("rpc server: connection from {}", peer);
                        let service = service.clone();
                        let buffers = buffers.clone();
                        crate::go(move || serve_connection(service, conn, buffers));
                    }
                    Err(e) => {
                        error!("rpc server: accept error: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(bound)
    }
}

fn serve_connection(service: Arc<dyn Service>, fd: RawFd, buffers: Pool<Vec<u8>>) {
    let _ = sock::set_tcp_keepalive(fd);
    let _ = sock::set_tcp_nodelay(fd);
    let mut buf = buffers.pop().unwrap_or_default();

    loop {
        match serve_one(&*service, fd, &mut buf) {
            Ok(true) => {}
            Ok(false) => {
                debug!("rpc server: client {} closed the connection", fd);
                break;
            }
            Err(e) => {
                debug!("rpc server: connection {} error: {}", fd, e);
                break;
            }
        }
    }

    buf.clear();
    buffers.push(buf);
    let _ = sock::close(fd, 0);
}

/// Handle one request; `Ok(false)` means the peer closed.
fn serve_one(service: &dyn Service, fd: RawFd, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut header = [0u8; HEADER_LEN];
    if sock::recvn(fd, &mut header, CONN_IDLE_MS)? == 0 {
        return Ok(false);
    }
    let len = decode_header(&header)?;

    buf.resize(len, 0);
    if sock::recvn(fd, buf, RECV_TIMEOUT_MS)? == 0 {
        return Ok(false);
    }

    let req: Value = serde_json::from_slice(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut res = Value::Object(Default::default());
    service.process(&req, &mut res);

    let body = serde_json::to_vec(&res)?;
    sock::send(fd, &encode_header(body.len()), SEND_TIMEOUT_MS)?;
    sock::send(fd, &body, SEND_TIMEOUT_MS)?;
    Ok(true)
}

/// An RPC client with one lazily-connected socket. Must be used from a
/// coroutine.
pub struct Client {
    host: String,
    port: u16,
    fd: RawFd,
}

impl Client {
    pub fn new(host: &str, port: u16) -> Client {
        Client { host: host.to_string(), port, fd: -1 }
    }

    fn ensure_connected(&mut self) -> io::Result<()> {
        if self.fd >= 0 {
            return Ok(());
        }
        let addr = match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port),
            Err(_) => hook::resolve(&self.host, self.port)?
                .into_iter()
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host not found"))?,
        };

        let fd = sock::tcp_socket(addr.is_ipv6())?;
        if let Err(e) = sock::connect(fd, &addr, CONN_TIMEOUT_MS) {
            let _ = sock::close(fd, 0);
            return Err(e);
        }
        let _ = sock::set_tcp_nodelay(fd);
        self.fd = fd;
        Ok(())
    }

    pub fn call(&mut self, req: &Value) -> io::Result<Value> {
        self.ensure_connected()?;
        match self.do_call(req) {
            Ok(v) => Ok(v),
            Err(e) => {
                // the stream state is unknown now, reconnect next time
                self.close();
                Err(e)
            }
        }
    }

    fn do_call(&mut self, req: &Value) -> io::Result<Value> {
        let body = serde_json::to_vec(req)?;
        sock::send(self.fd, &encode_header(body.len()), SEND_TIMEOUT_MS)?;
        sock::send(self.fd, &body, SEND_TIMEOUT_MS)?;

        let mut header = [0u8; HEADER_LEN];
        if sock::recvn(self.fd, &mut header, RECV_TIMEOUT_MS)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let len = decode_header(&header)?;

        let mut buf = vec![0u8; len];
        if sock::recvn(self.fd, &mut buf, RECV_TIMEOUT_MS)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            let _ = hook::close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::{decode_header, encode_header, HEADER_LEN};

    #[test]
    fn test_header_roundtrip() {
        let h = encode_header(4096);
        assert_eq!(decode_header(&h).unwrap(), 4096);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut h = [0u8; HEADER_LEN];
        h[4..8].copy_from_slice(&16u32.to_be_bytes());
        assert!(decode_header(&h).is_err());
    }

    #[test]
    fn test_header_too_large() {
        let h = encode_header(usize::MAX & 0xffff_ffff);
        assert!(decode_header(&h).is_err());
    }
}

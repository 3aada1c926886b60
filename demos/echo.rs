extern crate corio;
extern crate env_logger;

use std::sync::mpsc::channel;

use corio as co;
use corio::sock;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn main() {
    env_logger::init();

    let addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .expect("bad listen address");

    let fd = sock::tcp_socket(addr.is_ipv6()).unwrap();
    sock::set_reuseaddr(fd).unwrap();
    sock::bind(fd, &addr).unwrap();
    sock::listen(fd, 1024).unwrap();
    println!("Starting tcp echo server on {}", addr);

    let (tx, rx) = channel::<()>();
    co::go(move || {
        loop {
            let (conn, peer) = match sock::accept(fd) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("accept error: {}", e);
                    break;
                }
            };
            println!("connection from {}", peer);

            co::go(move || {
                let mut buf = [0u8; 16 * 1024];
                loop {
                    match sock::recv(conn, &mut buf, -1) {
                        Ok(0) => break, // eof
                        Ok(n) => {
                            if sock::send(conn, &buf[..n], -1).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let _ = sock::close(conn, 0);
            });
        }
        tx.send(()).unwrap();
    });

    // serve until the accept loop dies
    rx.recv().unwrap();
}

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::settings::ServerConfig;

use super::http_handler::HttpHandler;

/// Plain-HTTP front listener. Every request goes through [`HttpHandler`].
pub struct ProxyServer {
    bind: String,
    backlog: i32,
    handler: Arc<HttpHandler>,
}

impl ProxyServer {
    pub fn new(config: &ServerConfig, handler: Arc<HttpHandler>) -> Self {
        Self {
            bind: config.bind.clone(),
            backlog: config.listen_backlog,
            handler,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = bind_tcp_listener(&self.bind, self.backlog)?;
        let listener = TcpListener::from_std(listener)?;
        info!(addr = %self.bind, "Proxy listener started");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "Failed to accept TCP connection");
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(serve_connection(stream, handler, peer_addr.ip()));
        }
    }
}

fn bind_tcp_listener(addr: &str, backlog: i32) -> Result<std::net::TcpListener, Box<dyn std::error::Error + Send + Sync>> {
    let sock_addr: std::net::SocketAddr = addr.parse()?;

    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

async fn serve_connection(stream: TcpStream, handler: Arc<HttpHandler>, peer_ip: IpAddr) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let h = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(h.handle(req, Some(peer_ip)).await) }
    });

    let conn = http1::Builder::new().keep_alive(true).serve_connection(io, service);

    if let Err(err) = conn.await {
        debug!(client_ip = %peer_ip, error = %err, "HTTP connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejects_bad_address() {
        assert!(bind_tcp_listener("not-an-address", 16).is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_tcp_listener("127.0.0.1:0", 16).unwrap();
        let listener = TcpListener::from_std(listener).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}

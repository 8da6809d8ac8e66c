//! Peer link: produces connected, tuned TCP streams
//!
//! Sockets are built through `socket2` so timeouts, keepalive and address
//! reuse are set before the stream is handed to a session.

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| NetworkError::ConnectionFailed(format!("{}: no address", addr)).into())
}

/// Apply per-connection options to a connected stream
pub fn configure_stream(stream: &TcpStream, config: &NetworkConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    stream.set_read_timeout(config.read_timeout())?;
    stream.set_write_timeout(config.write_timeout())?;

    if let Some(secs) = config.keepalive_secs {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(secs));
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Connect to `addr` within the configured connect timeout
pub fn connect(addr: &str, config: &NetworkConfig) -> Result<TcpStream> {
    let target = resolve(addr)?;
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

    socket
        .connect_timeout(&SockAddr::from(target), config.connect_timeout())
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", target, e)))?;

    let stream: TcpStream = socket.into();
    configure_stream(&stream, config)?;
    tracing::info!("Connected to {}", target);
    Ok(stream)
}

/// Bind a listener on the configured address and port
pub fn listen(config: &NetworkConfig) -> Result<TcpListener> {
    let addr = resolve(&config.listen_address())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    socket
        .listen(16)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let listener: TcpListener = socket.into();
    tracing::info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until `running` is cleared, handing each configured
/// stream to `on_connected`. Connections are served one at a time.
pub fn accept_loop<F>(
    listener: &TcpListener,
    config: &NetworkConfig,
    running: &Arc<AtomicBool>,
    mut on_connected: F,
) -> Result<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    listener.set_nonblocking(true)?;

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                if let Err(e) = configure_stream(&stream, config) {
                    tracing::warn!("Dropping connection from {}: {}", peer, e);
                    continue;
                }
                tracing::info!("Accepted connection from {}", peer);
                on_connected(stream, peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                return Err(NetworkError::ConnectionFailed(e.to_string()).into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_connect_and_accept() {
        let config = loopback_config();
        let listener = listen(&config).unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let server_running = running.clone();
        let server_config = config.clone();
        let server = thread::spawn(move || {
            let mut received = Vec::new();
            accept_loop(&listener, &server_config, &server_running, |mut stream, _| {
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).unwrap();
                received.extend_from_slice(&buf);
                server_running.store(false, Ordering::SeqCst);
            })
            .unwrap();
            received
        });

        let mut client = connect(&addr.to_string(), &config).unwrap();
        assert!(client.nodelay().unwrap());
        client.write_all(b"hello").unwrap();

        assert_eq!(server.join().unwrap(), b"hello");
    }

    #[test]
    fn test_connect_refused() {
        let config = loopback_config();
        let port = {
            let listener = listen(&config).unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect(&format!("127.0.0.1:{}", port), &config).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Network(NetworkError::ConnectionFailed(_))
        ));
    }
}

use std::net::Ipv4Addr;
use tokio::net::TcpStream;

/// Detect whether something is accepting TCP connections on localhost:`port`.
///
/// One connect attempt, OS default timeout. Any error counts as closed.
pub async fn is_port_open(port: u16) -> bool {
    match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(_) => true,
        Err(e) => {
            tracing::trace!(port, error = %e, "port probe failed");
            false
        }
    }
}

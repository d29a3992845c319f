use std::time::Duration;
use log::trace;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::models::PortState;

/// Probe a single TCP port with a plain connect.
///
/// Refused, unreachable, timed out and unresolvable targets are all reported
/// as `Closed`; the caller only needs to know whether a service answered.
/// One attempt per port, no retries. The stream is dropped before returning.
pub async fn probe(host: &str, port: u16, timeout_duration: Duration) -> PortState {
    match timeout(timeout_duration, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => {
            trace!("[Probe:{}:{}] Connect succeeded", host, port);
            PortState::Open
        },
        Ok(Err(e)) => {
            trace!("[Probe:{}:{}] Connect failed: {}", host, port, e);
            PortState::Closed
        },
        Err(_) => {
            trace!("[Probe:{}:{}] Connect timed out after {:?}", host, port, timeout_duration);
            PortState::Closed
        }
    }
}

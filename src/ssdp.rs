//! SSDP multicast discovery of UPnP/DLNA renderers.
//!
//! Grounded on `dlna/discover.py` of the original implementation: a
//! non-standard local bind port avoids colliding with a host's own SSDP
//! daemon, and device identification is dedup'd purely by `LOCATION` URL.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;
use crate::impl_startable;
use crate::lifecycle::Startable;

const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_REMOTE_PORT: u16 = 1900;
const SSDP_LOCAL_PORT: u16 = SSDP_REMOTE_PORT + 10;
const SEND_INTERVAL: Duration = Duration::from_secs(30);

const M_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 10\r\nST: ssdp:all\r\n\r\n";

/// Parses an SSDP response datagram, discarding the status line, and
/// returns the lower-cased `location` header value if present.
pub fn parse_location(datagram: &str) -> Option<String> {
    let mut lines = datagram.split("\r\n");
    lines.next(); // HTTP status line, discarded
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("location") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Deduplicates discovered device locations and hands each new one off to a
/// callback channel exactly once.
pub struct SsdpDiscoverer {
    static_location: Option<String>,
    seen: Mutex<std::collections::HashSet<String>>,
    new_device_tx: mpsc::UnboundedSender<String>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SsdpDiscoverer {
    pub fn new(static_location: Option<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                static_location,
                seen: Mutex::new(std::collections::HashSet::new()),
                new_device_tx: tx,
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
            rx,
        )
    }

    fn on_location(&self, location: String) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.insert(location.clone()) {
            let _ = self.new_device_tx.send(location);
        }
    }

    async fn start_internal(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(location) = self.static_location.clone() {
            tracing::info!("static location_url configured, skipping multicast discovery");
            self.on_location(location);
            return Ok(());
        }

        let socket = bind_socket().await?;
        let this = self.clone_handle();
        let handle = tokio::spawn(async move {
            this.discovery_loop(socket).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop_internal(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    async fn discovery_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = [0u8; 4096];
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = socket
                .send_to(M_SEARCH.as_bytes(), (SSDP_MULTICAST_ADDR, SSDP_REMOTE_PORT))
                .await
            {
                tracing::warn!("ssdp send failed: {}", e);
            }

            let deadline = tokio::time::Instant::now() + SEND_INTERVAL;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                    Ok(Ok((n, _addr))) => {
                        if let Ok(text) = std::str::from_utf8(&buf[..n]) {
                            if let Some(location) = parse_location(text) {
                                self.on_location(location);
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("ssdp recv error: {}", e);
                        break;
                    }
                    Err(_timeout) => break,
                }
            }
        }
    }
}

async fn bind_socket() -> Result<UdpSocket, DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", SSDP_LOCAL_PORT)).await?;
    let std_socket = socket.into_std()?;
    let socket2 = socket2::Socket::from(std_socket);
    socket2.set_multicast_ttl_v4(4).ok();
    socket2
        .join_multicast_v4(&SSDP_MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)
        .ok();
    Ok(UdpSocket::from_std(socket2.into())?)
}

impl_startable!(SsdpDiscoverer, "ssdp");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_location_extracts_lowercased_header() {
        let datagram = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: http://192.0.2.4:49152/desc.xml\r\nST: ssdp:all\r\n\r\n";
        assert_eq!(parse_location(datagram).as_deref(), Some("http://192.0.2.4:49152/desc.xml"));
    }

    #[test]
    fn parse_location_returns_none_without_location_header() {
        let datagram = "HTTP/1.1 200 OK\r\nST: ssdp:all\r\n\r\n";
        assert_eq!(parse_location(datagram), None);
    }

    #[test]
    fn discovery_dedups_by_location() {
        let (discoverer, mut rx) = SsdpDiscoverer::new(None);
        discoverer.on_location("http://192.0.2.4:49152/desc.xml".to_string());
        discoverer.on_location("http://192.0.2.4:49152/desc.xml".to_string());
        discoverer.on_location("http://192.0.2.5:49152/desc.xml".to_string());
        rx.close();
        let mut received = Vec::new();
        while let Ok(loc) = rx.try_recv() {
            received.push(loc);
        }
        assert_eq!(received.len(), 2);
    }
}

//! Plex GDM (discovery multicast) beacon, one instance per bridged device.
//!
//! Grounded on `plex/gdm.py`: binds UDP 32412, joins 239.0.0.250, announces
//! with a `HELLO` datagram on startup and replies to non-loopback
//! `M-SEARCH` probes with the same key-value block.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::impl_startable;
use crate::lifecycle::Startable;

const GDM_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 250);
const GDM_MULTICAST_PORT: u16 = 32413;
const GDM_PORT: u16 = 32412;

#[derive(Clone)]
pub struct GdmClientData {
    pub name: String,
    pub port: u16,
    pub product: String,
    pub version: String,
    pub uuid: String,
}

impl GdmClientData {
    fn render(&self) -> String {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut block = String::new();
        for (key, value) in [
            ("Name", self.name.clone()),
            ("Port", self.port.to_string()),
            ("Content-Type", "plex/media-player".to_string()),
            ("Product", self.product.clone()),
            ("Protocol", "plex".to_string()),
            ("Protocol-Version", "1".to_string()),
            ("Protocol-Capabilities", "timeline,playback,playqueues".to_string()),
            ("Version", self.version.clone()),
            ("Resource-Identifier", self.uuid.clone()),
            ("Updated-At", updated_at.to_string()),
            ("Device-Class", "stb".to_string()),
        ] {
            block.push_str(&format!("{}: {}\n", key, value));
        }
        block
    }
}

/// Bind state shared by a running beacon. `None` on each field means "not
/// yet started" and lets `start`/`stop` be idempotent.
pub struct GdmBeacon {
    data: GdmClientData,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GdmBeacon {
    pub fn new(data: GdmClientData) -> Self {
        Self {
            data,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    async fn start_internal(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = bind_socket().await?;
        let hello = format!("HELLO * HTTP/1.0\n{}", self.data.render());
        socket.send_to(hello.as_bytes(), (GDM_MULTICAST_ADDR, GDM_MULTICAST_PORT)).await?;

        let data = self.data.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        let Ok(text) = std::str::from_utf8(&buf[..n]) else { continue };
                        if text.starts_with("M-SEARCH * HTTP/1.") && addr.ip().to_string() != "127.0.0.1" {
                            // Rendered fresh per reply so Updated-At reflects real send time.
                            let reply = format!("HTTP/1.0 200 OK\n{}", data.render());
                            if let Err(e) = socket.send_to(reply.as_bytes(), addr).await {
                                tracing::warn!("gdm reply failed: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("gdm recv error: {}", e);
                        return;
                    }
                }
            }
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
}

async fn bind_socket() -> anyhow::Result<UdpSocket> {
    let std_socket = std::net::UdpSocket::bind(("0.0.0.0", GDM_PORT))?;
    let socket2 = socket2::Socket::from(std_socket);
    socket2.set_reuse_address(true).ok();
    #[cfg(unix)]
    socket2.set_reuse_port(true).ok();
    socket2.set_multicast_ttl_v4(255).ok();
    socket2.join_multicast_v4(&GDM_MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket2.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket2.into())?)
}

impl_startable!(GdmBeacon, "gdm");

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn client_data_renders_required_fields() {
        let data = GdmClientData {
            name: "Living Room TV".to_string(),
            port: 32488,
            product: "Plex DLNA Bridge".to_string(),
            version: "1".to_string(),
            uuid: "abcd-1234".to_string(),
        };
        let rendered = data.render();
        assert!(rendered.contains("Name: Living Room TV\n"));
        assert!(rendered.contains("Port: 32488\n"));
        assert!(rendered.contains("Protocol: plex\n"));
        assert!(rendered.contains("Protocol-Capabilities: timeline,playback,playqueues\n"));
        assert!(rendered.contains("Resource-Identifier: abcd-1234\n"));
        assert!(rendered.contains("Device-Class: stb\n"));
    }

    #[test]
    fn render_computes_updated_at_fresh_each_call() {
        let data = GdmClientData {
            name: "Living Room TV".to_string(),
            port: 32488,
            product: "Plex DLNA Bridge".to_string(),
            version: "1".to_string(),
            uuid: "abcd-1234".to_string(),
        };
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let rendered = data.render();
        let after = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let updated_at: u64 = rendered
            .lines()
            .find_map(|l| l.strip_prefix("Updated-At: "))
            .and_then(|v| v.parse().ok())
            .expect("Updated-At present");
        assert!(updated_at >= before && updated_at <= after);
    }
}

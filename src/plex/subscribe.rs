//! Server-side timeline push and per-client subscriber fan-out, plus the
//! long-poll wait loop behind `/player/timeline/poll`.
//!
//! Grounded on `original_source/plex/subscribe.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::plex::adapter::PlexDlnaAdapter;
use crate::upnp::device::DlnaDevice;

pub const CONTROLLABLE: &str =
    "playPause,stop,volume,shuffle,repeat,seekTo,skipPrevious,skipNext,stepBack,stepForward";

const TIMELINE_STOPPED: &str = concat!(
    "<MediaContainer commandID=\"{command_id}\">",
    "<Timeline type=\"music\" state=\"stopped\"/>",
    "<Timeline type=\"video\" state=\"stopped\"/>",
    "<Timeline type=\"photo\" state=\"stopped\"/>",
    "</MediaContainer>",
);

const TIMELINE_DISCONNECTED: &str = concat!(
    "<MediaContainer commandID=\"{command_id}\" disconnected=\"1\">",
    "<Timeline type=\"music\" state=\"stopped\"/>",
    "<Timeline type=\"video\" state=\"stopped\"/>",
    "<Timeline type=\"photo\" state=\"stopped\"/>",
    "</MediaContainer>",
);

fn timeline_playing(parameters: &str) -> String {
    format!(
        "<MediaContainer commandID=\"{{command_id}}\"><Timeline controllable=\"{CONTROLLABLE}\" type=\"music\" {parameters}/>\
         <Timeline type=\"video\" state=\"stopped\"/><Timeline type=\"photo\" state=\"stopped\"/></MediaContainer>"
    )
}

/// PMS-identifying headers sent on every request the bridge makes to a
/// Plex client or to plex.tv, grounded on `original_source/utils/__init__.py::pms_header`.
pub fn pms_header(device: &DlnaDevice, config: &Config) -> Vec<(String, String)> {
    vec![
        ("X-Plex-Client-Identifier".to_string(), device.uuid.clone()),
        ("X-Plex-Device".to_string(), device.model.clone()),
        ("X-Plex-Device-Name".to_string(), device.name()),
        ("X-Plex-Platform".to_string(), config.platform.clone()),
        ("X-Plex-Platform-Version".to_string(), config.platform_version.clone()),
        ("X-Plex-Product".to_string(), device.model.clone()),
        ("X-Plex-Version".to_string(), config.version.clone()),
        ("X-Plex-Provides".to_string(), "player,pubsub-player".to_string()),
    ]
}

/// Headers the bridge attaches when pushing a timeline to a subscribed
/// Plex client, grounded on `utils/__init__.py::subscriber_send_headers`.
pub fn subscriber_send_headers(device: &DlnaDevice, config: &Config) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "application/xml".to_string()),
        ("Connection".to_string(), "Keep-Alive".to_string()),
        ("X-Plex-Client-Identifier".to_string(), device.uuid.clone()),
        ("X-Plex-Platform".to_string(), config.platform.clone()),
        ("X-Plex-Platform-Version".to_string(), config.platform_version.clone()),
        ("X-Plex-Product".to_string(), device.model.clone()),
        ("X-Plex-Version".to_string(), config.version.clone()),
        ("X-Plex-Device-Name".to_string(), device.name()),
        ("Accept-Encoding".to_string(), "gzip, deflate".to_string()),
        ("Accept-Language".to_string(), "en,*".to_string()),
    ]
}

struct Subscriber {
    uuid: String,
    host: String,
    port: u16,
    protocol: String,
    command_id: Mutex<i64>,
}

impl Subscriber {
    fn url(&self) -> String {
        format!("{}://{}:{}/:/timeline", self.protocol, self.host, self.port)
    }

    /// Substitutes this subscriber's last-seen `commandID` into `msg` and
    /// POSTs it with a 1s timeout; removes itself from `manager` on any
    /// failure, matching the original's self-eviction on a dead client.
    async fn send(self: &Arc<Self>, msg: &str, device: &DlnaDevice, config: &Config, http: &Client, manager: &SubscribeManager) {
        let command_id = *self.command_id.lock().await;
        let body = msg.replace("{command_id}", &command_id.to_string());
        let mut req = http.post(self.url()).body(body);
        for (k, v) in subscriber_send_headers(device, config) {
            req = req.header(k, v);
        }
        let result = req.timeout(Duration::from_secs(1)).send().await;
        let failed = match result {
            Ok(resp) => resp.error_for_status().is_err(),
            Err(_) => true,
        };
        if failed {
            tracing::debug!(subscriber = %self.uuid, target = %device.uuid, "subscriber send failed, removing");
            let newly_empty = manager.remove_subscriber(&self.uuid, Some(&device.uuid)).await;
            if !newly_empty.is_empty() {
                for service_type in [crate::upnp::UPNP_AVT_SERVICE_TYPE, crate::upnp::UPNP_RC_SERVICE_TYPE] {
                    if let Some(service) = device.service(service_type) {
                        service.mark_subscribed(false);
                    }
                }
            }
        }
    }
}

/// Per-device subscriber lists plus the last pushed server-notify state,
/// used to dedupe repeated "stopped" pushes to the bound Plex Media Server.
pub struct SubscribeManager {
    subscribers: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
    last_server_notify_state: Mutex<HashMap<String, String>>,
    http: Client,
    config: Config,
}

impl SubscribeManager {
    pub fn new(http: Client, config: Config) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            last_server_notify_state: Mutex::new(HashMap::new()),
            http,
            config,
        }
    }

    pub async fn add_subscriber(&self, target_uuid: &str, client_uuid: &str, host: &str, port: u16, protocol: &str, command_id: i64) {
        let mut subs = self.subscribers.lock().await;
        let list = subs.entry(target_uuid.to_string()).or_default();
        if let Some(existing) = list.iter().find(|s| s.uuid == client_uuid) {
            if existing.host == host && existing.port == port && existing.protocol == protocol {
                *existing.command_id.lock().await = command_id;
                return;
            }
            list.retain(|s| s.uuid != client_uuid);
        }
        list.push(Arc::new(Subscriber {
            uuid: client_uuid.to_string(),
            host: host.to_string(),
            port,
            protocol: protocol.to_string(),
            command_id: Mutex::new(command_id),
        }));
    }

    pub async fn update_command_id(&self, target_uuid: &str, client_uuid: &str, command_id: i64) {
        if let Some(list) = self.subscribers.lock().await.get(target_uuid) {
            if let Some(s) = list.iter().find(|s| s.uuid == client_uuid) {
                *s.command_id.lock().await = command_id;
            }
        }
    }

    /// Removes `client_uuid` from `target_uuid`'s list (or from every
    /// target's list when `target_uuid` is `None`). Returns the uuids of
    /// targets whose subscriber list became empty as a result, so the
    /// caller can stop that device's GENA subscription.
    pub async fn remove_subscriber(&self, client_uuid: &str, target_uuid: Option<&str>) -> Vec<String> {
        let mut subs = self.subscribers.lock().await;
        let targets: Vec<String> = match target_uuid {
            Some(t) => vec![t.to_string()],
            None => subs.keys().cloned().collect(),
        };
        let mut newly_empty = Vec::new();
        for t in targets {
            if let Some(list) = subs.get_mut(&t) {
                let had_subscribers = !list.is_empty();
                list.retain(|s| s.uuid != client_uuid);
                if had_subscribers && list.is_empty() {
                    newly_empty.push(t);
                }
            }
        }
        newly_empty
    }

    pub async fn subscriber_count(&self, target_uuid: &str) -> usize {
        self.subscribers.lock().await.get(target_uuid).map(|l| l.len()).unwrap_or(0)
    }

    /// Pushes the bridged device's current state to its bound Plex Media
    /// Server, unless one of the original's skip-conditions applies: no
    /// subscribers (and not forced), `no_notice` suppression, no current
    /// `plex_state`, or a repeated "stopped" push.
    pub async fn notify_server_device(&self, device: &DlnaDevice, adapter: &PlexDlnaAdapter, force: bool) {
        if self.subscriber_count(&device.uuid).await == 0 && !force {
            return;
        }
        if adapter.is_no_notice() && !force {
            tracing::debug!(uuid = %device.uuid, "ignore server notice: no_notice set");
            return;
        }
        let Some(plex_state) = adapter.plex_state().await else { return };

        {
            let mut last = self.last_server_notify_state.lock().await;
            if last.get(&device.uuid).map(String::as_str) == Some("stopped") && plex_state == "stopped" && !force {
                return;
            }
            last.insert(device.uuid.clone(), plex_state.to_string());
        }

        let Some(params) = adapter.get_pms_state().await else { return };
        if !params.iter().any(|(k, _)| k == "state") {
            return;
        }

        let plex_lib = adapter.plex_lib_snapshot().await;
        let mut url = match url::Url::parse(&plex_lib.timeline_url()) {
            Ok(u) => u,
            Err(_) => return,
        };
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(&k, &v);
            }
            for (k, v) in pms_header(device, &self.config) {
                pairs.append_pair(&k, &v);
            }
        }
        if let Err(e) = self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
            tracing::debug!(uuid = %device.uuid, error = %e, "notify server error");
        }
    }

    /// The long-poll response body for `device`'s current state, or `None`
    /// when there's nothing new to report (the caller retries after a
    /// short sleep), matching `msg_for_device`.
    pub async fn msg_for_device(&self, device: &DlnaDevice, adapter: &PlexDlnaAdapter) -> Option<String> {
        if adapter.is_no_notice() {
            return None;
        }
        let Some(mut state) = adapter.get_state().await else {
            return Some(TIMELINE_STOPPED.to_string());
        };
        if !state.iter().any(|(k, _)| k == "state") {
            return Some(TIMELINE_STOPPED.to_string());
        }
        if state.iter().any(|(k, v)| k == "state" && v == "stopped") {
            return Some(TIMELINE_STOPPED.to_string());
        }
        state.push(("itemType".to_string(), "music".to_string()));
        let parameters = state.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(" ");
        Some(timeline_playing(&parameters))
    }

    /// Pushes a freshly rendered timeline to every subscriber of `device`.
    pub async fn notify_device(&self, device: &DlnaDevice, adapter: &PlexDlnaAdapter) {
        if adapter.is_no_notice() {
            tracing::debug!(uuid = %device.uuid, "ignore device notice: no_notice set");
            return;
        }
        let Some(msg) = self.msg_for_device(device, adapter).await else { return };
        let subs = self.subscribers.lock().await.get(&device.uuid).cloned().unwrap_or_default();
        for sub in subs {
            sub.send(&msg, device, &self.config, &self.http, self).await;
        }
    }

    /// Pushes a `disconnected` timeline to every subscriber of `device`,
    /// then drops them all — used when the device itself goes away.
    pub async fn notify_device_disconnected(&self, device: &DlnaDevice) {
        let subs = self.subscribers.lock().await.get(&device.uuid).cloned().unwrap_or_default();
        for sub in &subs {
            sub.send(TIMELINE_DISCONNECTED, device, &self.config, &self.http, self).await;
        }
        self.subscribers.lock().await.remove(&device.uuid);
    }

    /// One notify pass: server push then client fan-out, for every
    /// `(device, adapter)` pair currently bridged.
    pub async fn notify(&self, devices: &[(Arc<DlnaDevice>, Arc<PlexDlnaAdapter>)]) {
        for (device, adapter) in devices {
            self.notify_server_device(device, adapter, false).await;
        }
        for (device, adapter) in devices {
            self.notify_device(device, adapter).await;
        }
    }

    /// Drives the push loop: an immediate notify, then on each tick either
    /// a change on one of the bridged devices or the interval elapsing,
    /// whichever comes first, bounded at `interval * 10` so an idle fleet
    /// still gets a periodic heartbeat push.
    pub async fn start<F, Fut>(self: &Arc<Self>, devices_fn: F, interval: Duration)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Vec<(Arc<DlnaDevice>, Arc<PlexDlnaAdapter>)>>,
    {
        self.notify(&devices_fn().await).await;
        loop {
            tokio::time::sleep(interval).await;
            let devices = devices_fn().await;
            let subscribed: Vec<_> = {
                let subs = self.subscribers.lock().await;
                devices.into_iter().filter(|(d, _)| subs.get(&d.uuid).map(|l| !l.is_empty()).unwrap_or(false)).collect()
            };
            if !subscribed.is_empty() {
                let wait_timeout = interval * 10;
                let waits = subscribed.iter().map(|(_, adapter)| adapter.wait_for_change(wait_timeout, vec![]));
                let _ = tokio::time::timeout(wait_timeout, futures::future::join_all(waits)).await;
            }
            self.notify(&devices_fn().await).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_subscriber_replaces_entry_with_same_identity_different_endpoint() {
        let manager = SubscribeManager::new(Client::new(), Config::default());
        manager.add_subscriber("dev-1", "client-a", "10.0.0.2", 32500, "http", 1).await;
        manager.add_subscriber("dev-1", "client-a", "10.0.0.3", 32500, "http", 2).await;
        let subs = manager.subscribers.lock().await;
        let list = subs.get("dev-1").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].host, "10.0.0.3");
    }

    #[tokio::test]
    async fn add_subscriber_updates_command_id_for_same_endpoint() {
        let manager = SubscribeManager::new(Client::new(), Config::default());
        manager.add_subscriber("dev-1", "client-a", "10.0.0.2", 32500, "http", 1).await;
        manager.add_subscriber("dev-1", "client-a", "10.0.0.2", 32500, "http", 7).await;
        let subs = manager.subscribers.lock().await;
        let list = subs.get("dev-1").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(*list[0].command_id.lock().await, 7);
    }

    #[tokio::test]
    async fn remove_subscriber_drops_from_named_target_only() {
        let manager = SubscribeManager::new(Client::new(), Config::default());
        manager.add_subscriber("dev-1", "client-a", "10.0.0.2", 32500, "http", 1).await;
        manager.add_subscriber("dev-2", "client-a", "10.0.0.2", 32500, "http", 1).await;
        let newly_empty = manager.remove_subscriber("client-a", Some("dev-1")).await;
        assert_eq!(newly_empty, vec!["dev-1".to_string()]);
        assert_eq!(manager.subscriber_count("dev-1").await, 0);
        assert_eq!(manager.subscriber_count("dev-2").await, 1);
    }

    #[tokio::test]
    async fn remove_subscriber_without_target_drops_everywhere() {
        let manager = SubscribeManager::new(Client::new(), Config::default());
        manager.add_subscriber("dev-1", "client-a", "10.0.0.2", 32500, "http", 1).await;
        manager.add_subscriber("dev-2", "client-a", "10.0.0.2", 32500, "http", 1).await;
        let mut newly_empty = manager.remove_subscriber("client-a", None).await;
        newly_empty.sort();
        assert_eq!(newly_empty, vec!["dev-1".to_string(), "dev-2".to_string()]);
        assert_eq!(manager.subscriber_count("dev-1").await, 0);
        assert_eq!(manager.subscriber_count("dev-2").await, 0);
    }

    #[tokio::test]
    async fn remove_subscriber_reports_no_targets_when_list_was_already_empty() {
        let manager = SubscribeManager::new(Client::new(), Config::default());
        let newly_empty = manager.remove_subscriber("client-a", Some("dev-1")).await;
        assert!(newly_empty.is_empty());
    }

    #[test]
    fn timeline_playing_carries_controllable_and_parameters() {
        let xml = timeline_playing("state=\"playing\" time=\"0\"");
        assert!(xml.contains(CONTROLLABLE));
        assert!(xml.contains("state=\"playing\" time=\"0\""));
        assert!(xml.contains("{command_id}"));
    }

    #[test]
    fn timeline_stopped_carries_three_media_types() {
        assert!(TIMELINE_STOPPED.contains("type=\"music\""));
        assert!(TIMELINE_STOPPED.contains("type=\"video\""));
        assert!(TIMELINE_STOPPED.contains("type=\"photo\""));
    }
}

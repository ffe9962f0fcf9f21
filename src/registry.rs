//! Single owning registry for bridged devices: wires SSDP discoveries into
//! `DlnaDevice` construction, state-engine/adapter/GDM-beacon spin-up, and
//! handles end-to-end teardown on device removal.
//!
//! Grounded on `original_source/plex/plexserver.py::on_new_dlna_device` and
//! `dlna/dlna_device.py::remove_self` — this crate's single "runtime" value
//! replacing the original's module-level `devices`/`adapters`/`g` globals,
//! per spec's cyclic-ownership design note.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, RwLock};

use crate::config::{apply_alias, Config, DataStore};
use crate::gdm::{GdmBeacon, GdmClientData};
use crate::lifecycle::Startable;
use crate::plex::{PlexDlnaAdapter, SubscribeManager};
use crate::ssdp::SsdpDiscoverer;
use crate::state::{spawn_engine, StateHandle};
use crate::upnp::device::{self, DlnaDevice, UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE};

/// Everything owned for one bridged renderer.
pub struct BridgedDevice {
    pub device: Arc<DlnaDevice>,
    pub adapter: Arc<PlexDlnaAdapter>,
    pub state: Arc<StateHandle>,
    gdm: Arc<GdmBeacon>,
    supervisor: tokio::task::JoinHandle<()>,
    gena_avt: tokio::task::JoinHandle<()>,
    gena_rc: tokio::task::JoinHandle<()>,
}

pub struct Registry {
    http: Client,
    config: Config,
    data_store: DataStore,
    devices: RwLock<HashMap<String, Arc<BridgedDevice>>>,
    subscribe_manager: Arc<SubscribeManager>,
    host_ip: RwLock<Option<String>>,
}

impl Registry {
    pub fn new(http: Client, config: Config) -> Arc<Self> {
        let data_store = DataStore::new(&config.config_path, &config.data_file_name);
        let subscribe_manager = Arc::new(SubscribeManager::new(http.clone(), config.clone()));
        let host_ip = RwLock::new(config.host_ip.clone());
        Arc::new(Self {
            http,
            config,
            data_store,
            devices: RwLock::new(HashMap::new()),
            subscribe_manager,
            host_ip,
        })
    }

    pub fn subscribe_manager(&self) -> &Arc<SubscribeManager> {
        &self.subscribe_manager
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_store(&self) -> &DataStore {
        &self.data_store
    }

    /// Records the host IP the bridge is reachable at, guessed from the
    /// first non-loopback request `Host` header seen, matching
    /// `guess_host_ip`. No-op once already set.
    pub async fn set_host_ip(&self, ip: &str) {
        let mut guard = self.host_ip.write().await;
        if guard.is_none() && !ip.starts_with("127.0.0") {
            *guard = Some(ip.to_string());
            tracing::info!("guessed host ip {}", ip);
        }
    }

    pub async fn host_ip(&self) -> Option<String> {
        self.host_ip.read().await.clone()
    }

    pub async fn by_uuid(&self, uuid: &str) -> Option<Arc<BridgedDevice>> {
        self.devices.read().await.get(uuid).cloned()
    }

    /// Stops renewing `uuid`'s GENA subscriptions, mirroring
    /// `DlnaDevice.stop_subscribe` — called once that target's last
    /// subscriber is removed. A later re-subscribe does not restart
    /// renewal, matching the original.
    pub async fn stop_gena_subscriptions(&self, uuid: &str) {
        let Some(bridged) = self.by_uuid(uuid).await else { return };
        for service_type in [UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE] {
            if let Some(service) = bridged.device.service(service_type) {
                service.mark_subscribed(false);
            }
        }
    }

    pub async fn list(&self) -> Vec<Arc<BridgedDevice>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Drives the discovery-to-bridge pipeline: owns the `SsdpDiscoverer`
    /// and, for each newly seen `LOCATION`, fetches/validates the device and
    /// brings up its full bridged stack.
    pub async fn run_discovery(self: &Arc<Self>, discoverer: Arc<SsdpDiscoverer>, mut new_device_rx: mpsc::UnboundedReceiver<String>) {
        let _ = discoverer.start().await;
        while let Some(location) = new_device_rx.recv().await {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.bridge_new_device(location.clone()).await {
                    tracing::warn!("failed to bridge device at {}: {}", location, e);
                }
            });
        }
    }

    async fn bridge_new_device(self: &Arc<Self>, location_url: String) -> anyhow::Result<()> {
        let url = url::Url::parse(&location_url)?;
        let config = self.config.clone();
        let data_store = self.data_store.clone();
        let device = device::fetch(url, &self.http, &config.product, |uuid, name, ip| {
            apply_alias(&config.aliases, None, uuid, name, &ip.to_string())
        })
        .await?;

        if self.devices.read().await.contains_key(&device.uuid) {
            return Ok(());
        }

        if let Some(alias) = data_store.alias_for_uuid(&device.uuid).await {
            device.set_name(alias);
        }
        let device = Arc::new(device);

        let (state, mut on_change) = spawn_engine_and_channel(Arc::clone(&device), self.http.clone());
        let plex_bind_token = data_store.token_for_uuid(&device.uuid).await;
        let adapter = PlexDlnaAdapter::new(Arc::clone(&device), self.http.clone(), Arc::clone(&state), plex_bind_token);

        let supervisor = {
            let device = Arc::clone(&device);
            let adapter = Arc::clone(&adapter);
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(set) = on_change.recv() => {
                            adapter.handle_change(set).await;
                        }
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {
                            if device.error_threshold_reached() {
                                tracing::warn!("device {} exceeded connection error threshold, removing", device.name());
                                registry.remove_device(&device.uuid).await;
                                return;
                            }
                        }
                    }
                }
            })
        };

        let gena_avt = spawn_gena_loop(Arc::clone(&device), self.http.clone(), self.config.http_port, Arc::clone(self), UPNP_AVT_SERVICE_TYPE);
        let gena_rc = spawn_gena_loop(Arc::clone(&device), self.http.clone(), self.config.http_port, Arc::clone(self), UPNP_RC_SERVICE_TYPE);

        let gdm = Arc::new(GdmBeacon::new(GdmClientData {
            name: device.name(),
            port: self.config.http_port,
            product: config.product.clone(),
            version: config.version.clone(),
            uuid: device.uuid.clone(),
        }));
        gdm.start().await?;

        let bridged = Arc::new(BridgedDevice {
            device: Arc::clone(&device),
            adapter,
            state,
            gdm,
            supervisor,
            gena_avt,
            gena_rc,
        });
        self.devices.write().await.insert(device.uuid.clone(), bridged);
        tracing::info!("bridged device {} ({})", device.name(), device.uuid);
        Ok(())
    }

    /// Full teardown for a device that's gone offline or exceeded its error
    /// threshold: stop GENA renewal, notify subscribers it's disconnected,
    /// stop the state engine, and drop the registry entry.
    pub async fn remove_device(self: &Arc<Self>, uuid: &str) {
        let Some(bridged) = self.devices.write().await.remove(uuid) else { return };
        bridged.gena_avt.abort();
        bridged.gena_rc.abort();
        bridged.supervisor.abort();
        self.subscribe_manager.notify_device_disconnected(&bridged.device).await;
        self.subscribe_manager.notify_server_device(&bridged.device, &bridged.adapter, true).await;
        bridged.state.shutdown().await;
        bridged.gdm.stop().await;
        bridged.adapter.wake_all_waiters().await;
    }

    /// The subscribe manager's periodic push loop, started once at startup.
    pub async fn run_subscribe_loop(self: &Arc<Self>) {
        let interval = Duration::from_secs_f64(self.config.plex_notify_interval);
        let registry = Arc::clone(self);
        let subscribe_manager = Arc::clone(&self.subscribe_manager);
        subscribe_manager
            .start(
                move || {
                    let registry = Arc::clone(&registry);
                    async move { registry.list().await.into_iter().map(|b| (Arc::clone(&b.device), Arc::clone(&b.adapter))).collect() }
                },
                interval,
            )
            .await;
    }
}

fn spawn_engine_and_channel(device: Arc<DlnaDevice>, http: Client) -> (Arc<StateHandle>, mpsc::UnboundedReceiver<crate::state::ChangeSet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = spawn_engine(device, http, tx);
    (state, rx)
}

/// One GENA subscribe/renew loop per service, mirroring
/// `loop_subscribe`: subscribe, then sleep half the GENA timeout before
/// renewing, for as long as `service.is_subscribed()` stays true. Set true
/// up front (same as the original's `service.subscribed = True` before the
/// while loop) and flipped false by `Registry::stop_gena_subscriptions` once
/// a target's last subscriber is removed, which ends this loop for good.
fn spawn_gena_loop(device: Arc<DlnaDevice>, http: Client, http_port: u16, registry: Arc<Registry>, service_type: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(service) = device.service(service_type) else { return };
        service.mark_subscribed(true);
        while service.is_subscribed() {
            let Some(host_ip) = registry.host_ip().await else {
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            };
            let _ = service.subscribe(&http, &host_ip, http_port, &device.uuid).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    })
}

//! UPnP root-device description, per-service state, and action dispatch.
//!
//! Grounded on `dlna/dlna_device.py`'s `DlnaDevice`/`DlnaDeviceService`: a
//! device is rejected unless it exposes both the AVTransport and
//! RenderingControl service types, and action dispatch without an explicit
//! service infers the service by scanning each cached SCPD for the action.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

use crate::error::DeviceError;
use crate::upnp::scpd::{strip_default_namespace, OneOrMany, Scpd};
use crate::upnp::soap;

pub const UPNP_AVT_SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const UPNP_RC_SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:RenderingControl:1";

const ERROR_COUNT_TO_REMOVE: u32 = 20;
const GENA_TIMEOUT_SEC: u64 = 120;

#[derive(Debug, Deserialize)]
struct RootDescription {
    device: DeviceDescription,
}

#[derive(Debug, Deserialize)]
struct DeviceDescription {
    #[serde(rename = "friendlyName")]
    friendly_name: String,
    #[serde(rename = "UDN")]
    udn: String,
    #[serde(rename = "modelDescription", default)]
    model_description: Option<String>,
    #[serde(rename = "serviceList")]
    service_list: ServiceListDescription,
}

#[derive(Debug, Deserialize)]
struct ServiceListDescription {
    #[serde(rename = "service", default)]
    service: OneOrMany<ServiceDescription>,
}

#[derive(Debug, Deserialize)]
struct ServiceDescription {
    #[serde(rename = "serviceType")]
    service_type: String,
    #[serde(rename = "controlURL")]
    control_url: String,
    #[serde(rename = "eventSubURL")]
    event_sub_url: String,
    #[serde(rename = "SCPDURL")]
    scpd_url: String,
}

/// What to send as an action's arguments. Mirrors the original's permissive
/// `control(action, data)` where `data` may be a bare scalar, nothing, or an
/// explicit ordered argument list.
pub enum ActionData {
    /// No caller-supplied arguments beyond whatever defaults apply.
    Empty,
    /// A single scalar value, inferred onto the one non-default argument the
    /// action's SCPD names.
    Scalar(String),
    /// Explicit `(argument name, value)` pairs, in caller order.
    Explicit(Vec<(String, String)>),
}

pub struct Service {
    pub service_type: String,
    pub control_url: Url,
    pub event_url: Url,
    pub scpd_url: Url,
    scpd: OnceCell<Scpd>,
    subscribed: AtomicBool,
    next_subscribe_at: Mutex<Option<Instant>>,
}

impl Service {
    fn new(desc: ServiceDescription, location_url: &Url) -> Result<Self, DeviceError> {
        Ok(Self {
            service_type: desc.service_type,
            control_url: location_url.join(&desc.control_url)?,
            event_url: location_url.join(&desc.event_sub_url)?,
            scpd_url: location_url.join(&desc.scpd_url)?,
            scpd: OnceCell::new(),
            subscribed: AtomicBool::new(false),
            next_subscribe_at: Mutex::new(None),
        })
    }

    pub async fn scpd(&self, http: &Client) -> Result<&Scpd, DeviceError> {
        self.scpd
            .get_or_try_init(|| async {
                let response = http.get(self.scpd_url.clone()).send().await?;
                response.error_for_status_ref().map_err(|e| {
                    DeviceError::NotValid {
                        location: self.scpd_url.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let xml = strip_default_namespace(&response.text().await?);
                let scpd: Scpd = quick_xml::de::from_str(&xml)?;
                Ok(scpd)
            })
            .await
    }

    pub fn cached_scpd(&self) -> Option<&Scpd> {
        self.scpd.get()
    }

    /// Invokes an action, applying the original's argument-inference and
    /// default-merge rules. Returns `Ok(None)` for a `UPnPError` fault body
    /// (the original logs and swallows it), `Ok(Some(xml))` with the raw
    /// `{action}Response` body otherwise.
    pub async fn control(
        &self,
        http: &Client,
        action: &str,
        data: ActionData,
        device: &DlnaDevice,
    ) -> Result<Option<String>, crate::error::SoapError> {
        use crate::error::SoapError;

        let scpd = self.scpd(http).await.map_err(|e| match e {
            DeviceError::Soap(s) => s,
            other => SoapError::UpnpFault(other.to_string()),
        })?;
        let spec = scpd
            .action(action)
            .ok_or_else(|| SoapError::NoSuchAction {
                action: action.to_string(),
                service_type: self.service_type.clone(),
            })?;

        let args: Vec<&str> = spec
            .argument_list
            .as_ref()
            .map(|l| l.argument.0.iter().map(|a| a.name.as_str()).collect())
            .unwrap_or_default();

        let mut fields: Vec<(String, String)> = match data {
            ActionData::Explicit(pairs) => pairs,
            ActionData::Empty => Vec::new(),
            ActionData::Scalar(value) => {
                let implicit: Vec<&str> = args
                    .iter()
                    .copied()
                    .filter(|name| soap::default_action_data(name).is_none())
                    .collect();
                match implicit.len() {
                    0 => Vec::new(),
                    1 => vec![(implicit[0].to_string(), value)],
                    needed => {
                        return Err(SoapError::InvalidArgument {
                            action: action.to_string(),
                            needed,
                        })
                    }
                }
            }
        };
        let supplied: std::collections::HashSet<&str> =
            fields.iter().map(|(k, _)| k.as_str()).collect();
        for name in &args {
            if !supplied.contains(name) {
                if let Some(default) = soap::default_action_data(name) {
                    fields.push((name.to_string(), default.to_string()));
                }
            }
        }

        let envelope = soap::build_envelope(action, &self.service_type, &fields);
        let result = soap::post_action(http, self.control_url.as_str(), &self.service_type, action, envelope).await;

        match result {
            Ok(body) => {
                device.repeat_error_count.store(0, Ordering::SeqCst);
                if let Some(fault) = soap::extract_upnp_fault(&body) {
                    tracing::warn!("dlna device {} {} control fault: {}", device.name(), action, fault);
                    Ok(None)
                } else {
                    Ok(Some(body))
                }
            }
            Err(err) => {
                if err.is_connect_class() {
                    let count = device.repeat_error_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= ERROR_COUNT_TO_REMOVE {
                        tracing::warn!(
                            "removing device {} after {} consecutive connection errors",
                            device.name(),
                            count
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Issues a GENA `SUBSCRIBE`. Skips the call entirely when the previous
    /// subscription hasn't reached its half-life renewal point yet.
    pub async fn subscribe(
        &self,
        http: &Client,
        host_ip: &str,
        http_port: u16,
        device_uuid: &str,
    ) -> Result<bool, crate::error::SoapError> {
        use crate::error::SoapError;

        if let Some(next_at) = *self.next_subscribe_at.lock().unwrap_or_else(|e| e.into_inner()) {
            if Instant::now() < next_at {
                return Ok(true);
            }
        }

        let callback = format!("<http://{}:{}/dlna/callback/{}>", host_ip, http_port, device_uuid);
        let method = Method::from_bytes(b"SUBSCRIBE").expect("static method name");
        let response = http
            .request(method, self.event_url.clone())
            .header("Cache-Control", "no-cache")
            .header("NT", "upnp:event")
            .header("Callback", callback)
            .header("Timeout", format!("Second-{}", GENA_TIMEOUT_SEC))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SoapError::Connect(e)
                } else {
                    SoapError::Request(e)
                }
            })?;

        let ok = response.status().is_success();
        if ok {
            *self.next_subscribe_at.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Instant::now() + Duration::from_secs(GENA_TIMEOUT_SEC / 2));
        }
        Ok(ok)
    }

    pub fn mark_subscribed(&self, value: bool) {
        self.subscribed.store(value, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }
}

pub struct DlnaDevice {
    pub uuid: String,
    name: Mutex<String>,
    pub model: String,
    pub ip: IpAddr,
    pub location_url: Url,
    pub services: HashMap<String, Service>,
    pub volume_min: i32,
    pub volume_max: i32,
    pub volume_step: i32,
    pub repeat_error_count: AtomicU32,
}

impl DlnaDevice {
    pub fn name(&self) -> String {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = name;
    }

    pub fn service(&self, service_type: &str) -> Option<&Service> {
        self.services.get(service_type)
    }

    /// Scans every cached SCPD for an action, mirroring
    /// `_find_service_by_action`'s fallback when no explicit service type is
    /// given.
    pub fn find_service_by_action(&self, action: &str) -> Option<&Service> {
        self.services
            .values()
            .find(|s| s.cached_scpd().map(|scpd| scpd.action(action).is_some()).unwrap_or(false))
    }

    /// True once `repeat_error_count` has reached the removal threshold;
    /// the registry's supervisor task polls this to decide teardown.
    pub fn error_threshold_reached(&self) -> bool {
        self.repeat_error_count.load(Ordering::SeqCst) >= ERROR_COUNT_TO_REMOVE
    }
}

/// Fetches the root device description, validates it, resolves service
/// URLs, and pre-fetches every service's SCPD (as the original does via
/// `asyncio.gather`). `alias` maps `(uuid, raw_name, ip)` to the publicly
/// visible device name.
pub async fn fetch(
    location_url: Url,
    http: &Client,
    product: &str,
    alias: impl FnOnce(&str, &str, &IpAddr) -> String,
) -> Result<DlnaDevice, DeviceError> {
    let response = http.get(location_url.clone()).send().await.map_err(|e| DeviceError::NotValid {
        location: location_url.to_string(),
        reason: e.to_string(),
    })?;
    if !response.status().is_success() {
        return Err(DeviceError::NotValid {
            location: location_url.to_string(),
            reason: format!("http status {}", response.status()),
        });
    }
    let raw_xml = response.text().await.map_err(|e| DeviceError::NotValid {
        location: location_url.to_string(),
        reason: e.to_string(),
    })?;
    let xml = strip_default_namespace(&raw_xml);
    let root: RootDescription = quick_xml::de::from_str(&xml).map_err(|e| DeviceError::NotValid {
        location: location_url.to_string(),
        reason: e.to_string(),
    })?;

    let name = root.device.friendly_name;
    let uuid = root
        .device
        .udn
        .strip_prefix("uuid:")
        .unwrap_or(&root.device.udn)
        .to_string();
    if name.trim().is_empty() || uuid.trim().is_empty() {
        return Err(DeviceError::NotValid {
            location: location_url.to_string(),
            reason: "missing friendlyName or UDN".to_string(),
        });
    }

    let model = root
        .device
        .model_description
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| product.to_string());

    let mut services = HashMap::new();
    for desc in root.device.service_list.service.0 {
        let service_type = desc.service_type.clone();
        services.insert(service_type, Service::new(desc, &location_url)?);
    }
    if !services.contains_key(UPNP_AVT_SERVICE_TYPE) || !services.contains_key(UPNP_RC_SERVICE_TYPE) {
        return Err(DeviceError::NotValid {
            location: location_url.to_string(),
            reason: "missing AVTransport or RenderingControl service".to_string(),
        });
    }

    let ip: IpAddr = location_url
        .host_str()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| DeviceError::NotValid {
            location: location_url.to_string(),
            reason: "location url has no resolvable host".to_string(),
        })?;

    let aliased_name = alias(&uuid, &name, &ip);

    for service in services.values() {
        service.scpd(http).await.ok();
    }

    let (volume_min, volume_max, volume_step) = services
        .get(UPNP_RC_SERVICE_TYPE)
        .and_then(|s| s.cached_scpd())
        .map(|scpd| scpd.volume_range())
        .unwrap_or((0, 100, 1));

    Ok(DlnaDevice {
        uuid,
        name: Mutex::new(aliased_name),
        model,
        ip,
        location_url,
        services,
        volume_min,
        volume_max,
        volume_step,
        repeat_error_count: AtomicU32::new(0),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn uuid_strips_prefix() {
        let udn = "uuid:abcd-1234";
        assert_eq!(udn.strip_prefix("uuid:").unwrap(), "abcd-1234");
    }
}

//! The bridge's single HTTP surface: the device-bind page, the GENA NOTIFY
//! callback, and every `/player/*` endpoint a Plex client speaks to.
//!
//! Grounded on `original_source/plex/plexserver.py`. The original spins up
//! one uvicorn instance per bridged device, each on its own allocated port,
//! so a client's `x-plex-target-client-identifier` header is implicit in
//! which port it talks to. This crate serves every device from one shared
//! listener instead, so that header (or the single bridged device, when
//! there's only one) is how a request picks its target.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Form, Router};
use serde::Deserialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::plex::pin_login;
use crate::plex::WaitField;
use crate::registry::{BridgedDevice, Registry};
use crate::upnp::device::DlnaDevice;
use crate::upnp::soap::parse_last_change;

const TARGET_HEADER: &str = "x-plex-target-client-identifier";
const CLIENT_HEADER: &str = "x-plex-client-identifier";
const XML_OK: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response code=\"200\" status=\"OK\"/>";

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(link_page).post(link_device))
        .route("/dlna/callback/{uuid}", any(dlna_callback))
        .route("/player/playback/playMedia", get(play_media))
        .route("/player/playback/refreshPlayQueue", get(refresh_play_queue))
        .route("/player/playback/play", get(play))
        .route("/player/playback/pause", get(pause))
        .route("/player/playback/stop", get(stop))
        .route("/player/playback/skipNext", get(skip_next))
        .route("/player/playback/skipPrevious", get(skip_previous))
        .route("/player/playback/seekTo", get(seek_to))
        .route("/player/playback/skipTo", get(skip_to))
        .route("/player/playback/setParameters", get(set_parameters))
        .route("/player/timeline/poll", get(timeline_poll))
        .route("/player/timeline/subscribe", get(timeline_subscribe))
        .route("/player/timeline/unsubscribe", get(timeline_unsubscribe))
        .route("/resources", get(resources))
        .route("/player/mirror/details", get(mirror_details))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Records the first non-loopback `Host` a request arrives with as the
/// bridge's externally reachable IP, matching `guess_host_ip`.
async fn guess_host_ip(registry: &Registry, headers: &HeaderMap) {
    if let Some(host) = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()) {
        let host = host.split(':').next().unwrap_or(host);
        registry.set_host_ip(host).await;
    }
}

async fn device_by_target(registry: &Registry, target_uuid: Option<&str>) -> Option<Arc<BridgedDevice>> {
    if let Some(uuid) = target_uuid {
        return registry.by_uuid(uuid).await;
    }
    let all = registry.list().await;
    if all.len() == 1 {
        return all.into_iter().next();
    }
    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Best-effort header value: device names/models come from vendor
/// firmware and aren't guaranteed to be valid header bytes, so a bad one
/// is dropped rather than panicking the request.
fn hv(s: &str) -> Option<axum::http::HeaderValue> {
    axum::http::HeaderValue::from_str(s).ok()
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Some(v) = hv(value) {
        headers.insert(name, v);
    }
}

/// Response headers for a known device, matching `plex_server_response_headers`.
fn device_response_headers(device: &DlnaDevice, registry: &Registry) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "Accept", "*/*");
    insert(&mut headers, "Connection", "keep-alive");
    insert(&mut headers, "Accept-Language", "en");
    insert(&mut headers, "X-Plex-Device", &device.model);
    insert(&mut headers, "X-Plex-Platform", &registry.config().platform);
    insert(&mut headers, "X-Plex-Platform-Version", &registry.config().platform_version);
    insert(&mut headers, "X-Plex-Product", &device.model);
    insert(&mut headers, "X-Plex-Version", &registry.config().version);
    insert(&mut headers, "X-Plex-Client-Identifier", &device.uuid);
    insert(&mut headers, "X-Plex-Device-Name", &device.name());
    insert(&mut headers, "X-Plex-Provides", "player,pubsub-player");
    headers
}

/// Response headers for an unresolved target (device not found, or none
/// bridged yet), matching `build_response`'s fallback branch.
fn fallback_response_headers(target_uuid: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "Accept", "*/*");
    insert(&mut headers, "Connection", "keep-alive");
    insert(&mut headers, "Accept-Language", "en");
    if let Some(uuid) = target_uuid {
        insert(&mut headers, "X-Plex-Client-Identifier", uuid);
    }
    headers
}

fn timeline_poll_headers(device: &DlnaDevice) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "X-Plex-Client-Identifier", &device.uuid);
    insert(&mut headers, "X-Plex-Protocol", "1.0");
    insert(&mut headers, "Access-Control-Allow-Origin", "*");
    insert(&mut headers, "Access-Control-Max-Age", "1209600");
    insert(&mut headers, "Access-Control-Expose-Headers", "X-Plex-Client-Identifier");
    insert(&mut headers, "Content-Type", "text/xml;charset=utf-8");
    headers
}

// ---------------------------------------------------------------------
// Bind page
// ---------------------------------------------------------------------

async fn link_page(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    render_link_page(&registry).await
}

async fn render_link_page(registry: &Registry) -> impl IntoResponse {
    let devices = registry.list().await;
    let mut rows = String::new();
    for bridged in &devices {
        let device = &bridged.device;
        if bridged.adapter.plex_bind_token().await.is_some() {
            rows.push_str(&format!(
                "<li>{name} ({uuid}) &mdash; bound</li>",
                name = device.name(),
                uuid = device.uuid
            ));
        } else {
            let pin_result = pin_login::get_pin(registry.http(), device, registry.config()).await;
            match pin_result {
                Ok((pin, pin_id)) => rows.push_str(&format!(
                    "<li>{name} ({uuid}) &mdash; enter PIN <b>{pin}</b> at plex.tv/link \
                     <form method=\"post\" action=\"/\"><input type=\"hidden\" name=\"uuid\" value=\"{uuid}\">\
                     <input type=\"hidden\" name=\"pin_id\" value=\"{pin_id}\">\
                     <button type=\"submit\">Check</button></form></li>",
                    name = device.name(),
                    uuid = device.uuid,
                    pin = pin,
                    pin_id = pin_id,
                )),
                Err(e) => {
                    tracing::warn!(uuid = %device.uuid, error = %e, "failed to get plex.tv pin");
                    rows.push_str(&format!("<li>{} ({}) &mdash; could not reach plex.tv</li>", device.name(), device.uuid));
                }
            }
        }
    }
    let body = format!("<html><body><h1>Bridged devices</h1><ul>{rows}</ul></body></html>");
    axum::response::Html(body)
}

#[derive(Debug, Deserialize)]
struct LinkForm {
    name: Option<String>,
    uuid: String,
    pin_id: Option<String>,
}

async fn link_device(State(registry): State<Arc<Registry>>, Form(form): Form<LinkForm>) -> impl IntoResponse {
    let Some(bridged) = registry.by_uuid(&form.uuid).await else {
        return (StatusCode::NOT_FOUND, format!("device not found {}", form.uuid)).into_response();
    };

    if let Some(pin_id) = form.pin_id.as_deref().filter(|s| !s.is_empty()) {
        if let Ok(pin_id) = pin_id.parse::<i64>() {
            match pin_login::check_pin(registry.http(), pin_id, &bridged.device, registry.config()).await {
                Ok(Some(token)) => {
                    registry.data_store().set_token_for_uuid(&form.uuid, &token).await;
                    bridged.adapter.set_plex_bind_token(token).await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(uuid = %form.uuid, error = %e, "pin check failed"),
            }
        }
    }

    if let Some(name) = form.name.filter(|n| !n.is_empty() && *n != bridged.device.name()) {
        bridged.device.set_name(name.clone());
        registry.data_store().save_alias(&form.uuid, &name).await;
    }

    render_link_page(&registry).await.into_response()
}

// ---------------------------------------------------------------------
// GENA event callback
// ---------------------------------------------------------------------

async fn dlna_callback(
    method: Method,
    State(registry): State<Arc<Registry>>,
    Path(uuid): Path<String>,
    body: String,
) -> impl IntoResponse {
    if method.as_str() != "NOTIFY" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if let Some(bridged) = registry.by_uuid(&uuid).await {
        let (state, uri, position) = parse_last_change(&body);
        bridged.adapter.update_state(state.as_deref(), uri.as_deref(), position.as_deref());
    }
    "".into_response()
}

// ---------------------------------------------------------------------
// Playback routes
// ---------------------------------------------------------------------

fn default_type() -> String {
    "music".to_string()
}

#[derive(Debug, Deserialize)]
struct PlayMediaQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    #[serde(rename = "containerKey")]
    container_key: String,
    key: Option<String>,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    paused: bool,
    #[serde(rename = "type", default = "default_type")]
    r#type: String,
}

async fn play_media(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Query(query): Query<PlayMediaQuery>,
    Query(raw): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let target_uuid = header_str(&headers, TARGET_HEADER);
    let client_uuid = header_str(&headers, CLIENT_HEADER);
    if let (Some(target), Some(client)) = (target_uuid, client_uuid) {
        registry.subscribe_manager().update_command_id(target, client, query.command_id).await;
    }
    let Some(bridged) = device_by_target(&registry, target_uuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if query.r#type == "music" {
        if let Err(e) = bridged
            .adapter
            .play_media(query.container_key.clone(), query.key.as_deref(), query.offset, query.paused, &raw)
            .await
        {
            tracing::warn!(uuid = %bridged.device.uuid, error = %e, "play_media failed");
        }
    } else {
        bridged.adapter.stop().await;
    }
    ("", device_response_headers(&bridged.device, &registry)).into_response()
}

#[derive(Debug, Deserialize)]
struct CommandQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    #[serde(rename = "type", default = "default_type")]
    r#type: String,
}

async fn update_command_id_and_target(
    registry: &Registry,
    headers: &HeaderMap,
    command_id: i64,
) -> (Option<String>, Option<Arc<BridgedDevice>>) {
    let target_uuid = header_str(headers, TARGET_HEADER).map(str::to_string);
    let client_uuid = header_str(headers, CLIENT_HEADER);
    if let (Some(target), Some(client)) = (target_uuid.as_deref(), client_uuid) {
        registry.subscribe_manager().update_command_id(target, client, command_id).await;
    }
    let bridged = device_by_target(registry, target_uuid.as_deref()).await;
    (target_uuid, bridged)
}

async fn refresh_play_queue(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let command_id = q.get("commandID").and_then(|v| v.parse().ok()).unwrap_or(0);
    let play_queue_id = q.get("playQueueID").and_then(|v| v.parse().ok()).unwrap_or(0);
    let (_, bridged) = update_command_id_and_target(&registry, &headers, command_id).await;
    let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
    if let Err(e) = bridged.adapter.refresh_queue(play_queue_id).await {
        tracing::warn!(uuid = %bridged.device.uuid, error = %e, "refresh_queue failed");
    }
    ("", device_response_headers(&bridged.device, &registry)).into_response()
}

async fn play(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<CommandQuery>) -> impl IntoResponse {
    let (_, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
    if q.r#type == "music" {
        bridged.adapter.play().await;
    } else {
        bridged.adapter.stop().await;
    }
    ("", device_response_headers(&bridged.device, &registry)).into_response()
}

async fn pause(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<CommandQuery>) -> impl IntoResponse {
    let (_, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
    if q.r#type == "music" {
        bridged.adapter.pause().await;
    }
    ("", device_response_headers(&bridged.device, &registry)).into_response()
}

async fn stop(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<CommandQuery>) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        if let Some(bridged) = &bridged {
            bridged.adapter.stop().await;
        }
    }
    (XML_OK, fallback_response_headers(target_uuid.as_deref())).into_response()
}

async fn skip_next(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<CommandQuery>) -> impl IntoResponse {
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
        if let Err(e) = bridged.adapter.next(false).await {
            tracing::warn!(uuid = %bridged.device.uuid, error = %e, "skipNext failed");
        }
    }
    ("", fallback_response_headers(target_uuid.as_deref())).into_response()
}

async fn skip_previous(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<CommandQuery>) -> impl IntoResponse {
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
        if let Err(e) = bridged.adapter.prev().await {
            tracing::warn!(uuid = %bridged.device.uuid, error = %e, "skipPrevious failed");
        }
    }
    ("", fallback_response_headers(target_uuid.as_deref())).into_response()
}

#[derive(Debug, Deserialize)]
struct SeekQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    offset: i64,
    #[serde(rename = "type", default = "default_type")]
    r#type: String,
}

async fn seek_to(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<SeekQuery>) -> impl IntoResponse {
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
        bridged.adapter.seek(q.offset).await;
    }
    ("", fallback_response_headers(target_uuid.as_deref())).into_response()
}

#[derive(Debug, Deserialize)]
struct SkipToQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    key: String,
    #[serde(rename = "type", default = "default_type")]
    r#type: String,
}

async fn skip_to(State(registry): State<Arc<Registry>>, headers: HeaderMap, Query(q): Query<SkipToQuery>) -> impl IntoResponse {
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
        if let Err(e) = bridged.adapter.skip_to_track(&q.key).await {
            tracing::warn!(uuid = %bridged.device.uuid, error = %e, "skipTo failed");
        }
    }
    ("", fallback_response_headers(target_uuid.as_deref())).into_response()
}

#[derive(Debug, Deserialize)]
struct SetParametersQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    #[serde(rename = "type", default = "default_type")]
    r#type: String,
    shuffle: Option<i32>,
    repeat: Option<i32>,
    volume: Option<f64>,
}

async fn set_parameters(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Query(q): Query<SetParametersQuery>,
) -> impl IntoResponse {
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    if q.r#type == "music" {
        let Some(bridged) = bridged else { return StatusCode::NOT_FOUND.into_response() };
        if let Some(shuffle) = q.shuffle {
            bridged.adapter.set_shuffle(shuffle);
        }
        if let Some(repeat) = q.repeat {
            bridged.adapter.set_repeat(crate::plex::RepeatMode::from_i32(repeat)).await;
        }
        if let Some(volume) = q.volume {
            bridged.adapter.set_volume(volume as i32).await;
        }
    }
    ("", fallback_response_headers(target_uuid.as_deref())).into_response()
}

// ---------------------------------------------------------------------
// Timeline subscribe / poll
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    #[serde(default)]
    wait: i32,
}

async fn timeline_poll(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Query(q): Query<PollQuery>,
) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let (target_uuid, bridged) = update_command_id_and_target(&registry, &headers, q.command_id).await;
    let Some(bridged) = bridged else {
        return (StatusCode::NOT_FOUND, format!("device not found {:?}", target_uuid)).into_response();
    };

    if q.wait == 1 {
        let timeout = std::time::Duration::from_secs_f64(registry.config().plex_notify_interval * 20.0);
        bridged
            .adapter
            .wait_for_change(timeout, vec![WaitField::State, WaitField::Volume, WaitField::Uri, WaitField::ElapsedJump])
            .await;
    }

    let interval = std::time::Duration::from_secs_f64(registry.config().plex_notify_interval);
    let msg = loop {
        if let Some(msg) = registry.subscribe_manager().msg_for_device(&bridged.device, &bridged.adapter).await {
            break msg;
        }
        tokio::time::sleep(interval).await;
    };
    let msg = msg.replace("{command_id}", &q.command_id.to_string());

    let registry_clone = Arc::clone(&registry);
    let bridged_clone = Arc::clone(&bridged);
    tokio::spawn(async move {
        registry_clone
            .subscribe_manager()
            .notify_server_device(&bridged_clone.device, &bridged_clone.adapter, true)
            .await;
    });

    (msg, timeline_poll_headers(&bridged.device)).into_response()
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    #[serde(rename = "commandID")]
    command_id: i64,
    port: u16,
    #[serde(default = "default_protocol")]
    protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

async fn timeline_subscribe(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Query(q): Query<SubscribeQuery>,
) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let target_uuid = header_str(&headers, TARGET_HEADER);
    let client_uuid = header_str(&headers, CLIENT_HEADER).unwrap_or_default();
    let Some(bridged) = device_by_target(&registry, target_uuid).await else {
        return (StatusCode::NOT_FOUND, format!("device not found {:?}", target_uuid)).into_response();
    };
    registry
        .subscribe_manager()
        .add_subscriber(&bridged.device.uuid, client_uuid, &addr.ip().to_string(), q.port, &q.protocol, q.command_id)
        .await;
    (XML_OK, fallback_response_headers(target_uuid)).into_response()
}

async fn timeline_unsubscribe(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Query(q): Query<CommandQuery>,
) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let target_uuid = header_str(&headers, TARGET_HEADER);
    let client_uuid = header_str(&headers, CLIENT_HEADER).unwrap_or_default();
    if let Some(target) = target_uuid {
        registry.subscribe_manager().update_command_id(target, client_uuid, q.command_id).await;
    }
    let newly_empty = registry.subscribe_manager().remove_subscriber(client_uuid, target_uuid).await;
    for uuid in newly_empty {
        registry.stop_gena_subscriptions(&uuid).await;
    }
    (XML_OK, fallback_response_headers(target_uuid)).into_response()
}

// ---------------------------------------------------------------------
// Resources / mirror
// ---------------------------------------------------------------------

async fn resources(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> impl IntoResponse {
    guess_host_ip(&registry, &headers).await;
    let target_uuid = header_str(&headers, TARGET_HEADER);
    let Some(bridged) = device_by_target(&registry, target_uuid).await else {
        return (StatusCode::NOT_FOUND, "no matching device").into_response();
    };
    let device = &bridged.device;
    let config = registry.config();
    let body = format!(
        "<MediaContainer><Player title=\"{name}\" protocol=\"plex\" protocolVersion=\"1\" \
         protocolCapabilities=\"timeline,playback,playqueues\" machineIdentifier=\"{uuid}\" product=\"{model}\" \
         platform=\"{platform}\" platformVersion=\"{platform_version}\" version=\"{version}\" \
         deviceClass=\"stb\"/></MediaContainer>",
        name = device.name(),
        uuid = device.uuid,
        model = device.model,
        platform = config.platform,
        platform_version = config.platform_version,
        version = config.version,
    );
    (body, device_response_headers(device, &registry)).into_response()
}

async fn mirror_details(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> impl IntoResponse {
    let target_uuid = header_str(&headers, TARGET_HEADER);
    let Some(_bridged) = device_by_target(&registry, target_uuid).await else {
        return (StatusCode::NOT_FOUND, format!("device not found {:?}", target_uuid)).into_response();
    };
    ("", fallback_response_headers(target_uuid)).into_response()
}

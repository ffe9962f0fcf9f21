//! Per-device state engine: polls UPnP transport/volume/mute state on a
//! dedicated OS thread and folds updates into a change-session diff.
//!
//! Grounded on `original_source/dlna/dlna_device_state.py`: a dedicated
//! thread with its own event loop isolates one device's slow I/O from
//! every other device and from the Plex-facing scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::upnp::device::{ActionData, DlnaDevice, UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE};
use crate::upnp::soap;

const NORMAL_INTERVAL: Duration = Duration::from_millis(800);
const IDLE_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_THRESHOLD: Duration = Duration::from_secs(90);
const TRANSPORT_EVERY: u64 = 10;
const VOLUME_EVERY: u64 = 12;
const MUTE_EVERY: u64 = 51;
const BATCH_WRAP: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
    Transitioning,
    NoMediaPresent,
}

impl TransportState {
    pub fn from_upnp(s: &str) -> Option<Self> {
        match s {
            "PLAYING" => Some(Self::Playing),
            "PAUSED_PLAYBACK" => Some(Self::Paused),
            "STOPPED" => Some(Self::Stopped),
            "TRANSITIONING" => Some(Self::Transitioning),
            "NO_MEDIA_PRESENT" => Some(Self::NoMediaPresent),
            _ => None,
        }
    }

    /// `plex_state` mapping from spec: the string surfaced to Plex clients.
    pub fn plex_state(&self) -> &'static str {
        match self {
            Self::Playing | Self::Transitioning => "playing",
            Self::Paused => "paused",
            Self::Stopped | Self::NoMediaPresent => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DlnaState {
    pub state: Option<TransportState>,
    pub volume: i32,
    pub muted: bool,
    pub elapsed_ms: i64,
    pub duration_ms: i64,
    pub current_uri: Option<String>,
}

impl Default for DlnaState {
    fn default() -> Self {
        Self {
            state: None,
            volume: 0,
            muted: false,
            elapsed_ms: 0,
            duration_ms: 0,
            current_uri: None,
        }
    }
}

/// One changed field's before/after pair.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    State(Option<TransportState>, Option<TransportState>),
    Volume(i32, i32),
    Muted(bool, bool),
    Elapsed(i64, i64),
    Duration(i64, i64),
    Uri(Option<String>, Option<String>),
}

/// The aggregated diff produced by one poll pass or one external update,
/// delivered to listeners exactly once (empty sessions are never emitted).
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains_elapsed_reset_at_zero(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, FieldChange::Elapsed(_, new) if *new == 0))
    }
}

/// Accumulates field diffs against a snapshot, applying writes in place and
/// recording only the ones that actually changed value. Mirrors the
/// original's "open session, write fields, close session" pattern — every
/// write inside one session lands in the same `ChangeSet`, so a caller never
/// observes a partially-applied session.
struct ChangeSession<'a> {
    state: &'a mut DlnaState,
    set: ChangeSet,
}

impl<'a> ChangeSession<'a> {
    fn new(state: &'a mut DlnaState) -> Self {
        Self {
            state,
            set: ChangeSet::default(),
        }
    }

    fn set_state(&mut self, value: Option<TransportState>) {
        if self.state.state != value {
            self.set.changes.push(FieldChange::State(self.state.state, value));
            self.state.state = value;
        }
    }

    fn set_volume(&mut self, value: i32) {
        if self.state.volume != value {
            self.set.changes.push(FieldChange::Volume(self.state.volume, value));
            self.state.volume = value;
        }
    }

    fn set_muted(&mut self, value: bool) {
        if self.state.muted != value {
            self.set.changes.push(FieldChange::Muted(self.state.muted, value));
            self.state.muted = value;
        }
    }

    fn set_elapsed(&mut self, value: i64) {
        if self.state.elapsed_ms != value {
            self.set.changes.push(FieldChange::Elapsed(self.state.elapsed_ms, value));
            self.state.elapsed_ms = value;
        }
    }

    fn set_duration(&mut self, value: i64) {
        if self.state.duration_ms != value {
            self.set.changes.push(FieldChange::Duration(self.state.duration_ms, value));
            self.state.duration_ms = value;
        }
    }

    fn set_uri(&mut self, value: Option<String>) {
        if self.state.current_uri != value {
            self.set
                .changes
                .push(FieldChange::Uri(self.state.current_uri.clone(), value.clone()));
            self.state.current_uri = value;
        }
    }

    fn close(self) -> ChangeSet {
        self.set
    }
}

/// `HH:MM:SS` -> milliseconds. Returns `None` for malformed input.
pub fn parse_timedelta(s: &str) -> Option<i64> {
    let mut parts = s.trim().splitn(3, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let sec: i64 = parts.next()?.parse().ok()?;
    Some((h * 3600 + m * 60 + sec) * 1000)
}

/// Milliseconds -> `HH:MM:SS`, truncating sub-second remainder.
pub fn format_timedelta(ms: i64) -> String {
    let total_secs = ms / 1000;
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

/// Rescales a device-reported volume in `[min, max]` (stepped by `step`) to
/// the Plex-facing `[0, 100]` integer scale.
pub fn device_volume_to_percent(raw: i32, min: i32, max: i32) -> i32 {
    if max <= min {
        return 0;
    }
    (((raw - min) as f64 / (max - min) as f64) * 100.0).round() as i32
}

/// Inverse of [`device_volume_to_percent`].
pub fn percent_to_device_volume(pct: i32, min: i32, max: i32, step: i32) -> i32 {
    if step <= 0 {
        return min;
    }
    let raw = min as f64 + (pct.clamp(0, 100) as f64 / 100.0) * (max - min) as f64;
    let stepped = (raw / step as f64).round() as i32 * step;
    stepped.clamp(min, max)
}

enum EngineCommand {
    ExternalUpdate {
        state: Option<TransportState>,
        // Outer `None` = leave unchanged; `Some(None)` = clear to no URI;
        // `Some(Some(uri))` = set. Distinguishes "don't touch" from the
        // original's explicit `uri=None` clear.
        uri: Option<Option<String>>,
        position_ms: Option<i64>,
    },
    CheckAllNextPass,
    Wake,
    Shutdown,
}

/// External handle to a device's dedicated-thread state engine.
pub struct StateHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    snapshot: Arc<Mutex<DlnaState>>,
}

impl StateHandle {
    pub async fn snapshot(&self) -> DlnaState {
        self.snapshot.lock().await.clone()
    }

    /// External update ingestion (e.g. a GENA NOTIFY or a command's
    /// optimistic local write), posted into the engine's own thread/loop.
    /// `uri: Some(None)` clears the current URI; `None` leaves it alone.
    pub fn update(&self, state: Option<TransportState>, uri: Option<Option<String>>, position_ms: Option<i64>) {
        let _ = self.cmd_tx.send(EngineCommand::ExternalUpdate { state, uri, position_ms });
    }

    pub fn request_check_all(&self) {
        let _ = self.cmd_tx.send(EngineCommand::CheckAllNextPass);
    }

    pub fn wake(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Wake);
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        if let Some(handle) = self.thread.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Spawns the dedicated OS thread (with its own single-thread tokio
/// runtime) that owns this device's state. `on_change` receives every
/// non-empty `ChangeSet`.
pub fn spawn_engine(
    device: Arc<DlnaDevice>,
    http: Client,
    on_change: mpsc::UnboundedSender<ChangeSet>,
) -> Arc<StateHandle> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let snapshot = Arc::new(Mutex::new(DlnaState::default()));
    let snapshot_for_thread = Arc::clone(&snapshot);

    let thread = std::thread::Builder::new()
        .name(format!("dlna-state-{}", device.uuid))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build per-device state runtime");
            runtime.block_on(engine_loop(device, http, snapshot_for_thread, cmd_rx, on_change));
        })
        .expect("failed to spawn per-device state thread");

    Arc::new(StateHandle {
        cmd_tx,
        thread: Mutex::new(Some(thread)),
        snapshot,
    })
}

async fn engine_loop(
    device: Arc<DlnaDevice>,
    http: Client,
    snapshot: Arc<Mutex<DlnaState>>,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    on_change: mpsc::UnboundedSender<ChangeSet>,
) {
    let mut pass: u64 = 0;
    let check_all = Arc::new(AtomicBool::new(true));
    let last_observed = Arc::new(Mutex::new(Instant::now()));
    let wake = Arc::new(Notify::new());

    loop {
        let idle_for = last_observed.lock().await.elapsed();
        let currently_active = {
            let s = snapshot.lock().await;
            matches!(s.state, Some(TransportState::Playing) | Some(TransportState::Transitioning))
        };
        let interval = if idle_for >= IDLE_THRESHOLD && !currently_active {
            IDLE_INTERVAL
        } else {
            NORMAL_INTERVAL
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCommand::Shutdown) | None => return,
                    Some(EngineCommand::Wake) => {}
                    Some(EngineCommand::CheckAllNextPass) => check_all.store(true, Ordering::SeqCst),
                    Some(EngineCommand::ExternalUpdate { state, uri, position_ms }) => {
                        let mut s = snapshot.lock().await;
                        let mut session = ChangeSession::new(&mut s);
                        if let Some(state) = state {
                            session.set_state(Some(state));
                        }
                        if let Some(uri) = uri {
                            session.set_uri(uri);
                        }
                        if let Some(position_ms) = position_ms {
                            session.set_elapsed(position_ms);
                        }
                        let set = session.close();
                        *last_observed.lock().await = Instant::now();
                        if !set.is_empty() {
                            let _ = on_change.send(set);
                        }
                    }
                }
                continue;
            }
        }

        pass = (pass + 1) % BATCH_WRAP;
        let do_check_all = check_all.swap(false, Ordering::SeqCst);
        let is_transitioning = matches!(snapshot.lock().await.state, Some(TransportState::Transitioning));
        let want_transport = pass % TRANSPORT_EVERY == 0 || do_check_all || is_transitioning;
        let want_volume = pass % VOLUME_EVERY == 0 || do_check_all;
        let want_mute = pass % MUTE_EVERY == 0;

        let position = poll_position(&device, &http).await;
        let transport = if want_transport { poll_transport(&device, &http).await } else { None };
        let volume = if want_volume { poll_volume(&device, &http).await } else { None };
        let mute = if want_mute { poll_mute(&device, &http).await } else { None };

        let mut s = snapshot.lock().await;
        let was_playing_like = matches!(s.state, Some(TransportState::Playing) | Some(TransportState::Transitioning));
        let mut session = ChangeSession::new(&mut s);

        let mut elapsed_unchanged = false;
        if let Some((elapsed_ms, duration_ms, uri)) = position {
            elapsed_unchanged = session.state.elapsed_ms == elapsed_ms;
            session.set_elapsed(elapsed_ms);
            session.set_duration(duration_ms);
            session.set_uri(uri);
        }
        if let Some(state) = transport {
            session.set_state(state);
        }
        if let Some(volume_pct) = volume {
            session.set_volume(volume_pct);
        }
        if let Some(muted) = mute {
            session.set_muted(muted);
        }

        let mut set = session.close();

        if transport.is_none() && elapsed_unchanged && was_playing_like && set.is_empty() {
            drop(s);
            if let Some(state) = poll_transport(&device, &http).await {
                let mut s = snapshot.lock().await;
                let mut session = ChangeSession::new(&mut s);
                session.set_state(state);
                set = session.close();
            }
        }

        *last_observed.lock().await = Instant::now();
        if !set.is_empty() {
            let _ = on_change.send(set);
        }
    }
}

async fn poll_position(device: &DlnaDevice, http: &Client) -> Option<(i64, i64, Option<String>)> {
    let service = device.service(UPNP_AVT_SERVICE_TYPE)?;
    let body = service.control(http, "GetPositionInfo", ActionData::Empty, device).await.ok()??;
    let elapsed = soap::extract_tag(&body, "RelTime").and_then(|s| parse_timedelta(&s))?;
    let duration = soap::extract_tag(&body, "TrackDuration").and_then(|s| parse_timedelta(&s)).unwrap_or(0);
    let uri = soap::extract_tag(&body, "TrackURI");
    Some((elapsed, duration, uri))
}

async fn poll_transport(device: &DlnaDevice, http: &Client) -> Option<Option<TransportState>> {
    let service = device.service(UPNP_AVT_SERVICE_TYPE)?;
    let body = service.control(http, "GetTransportInfo", ActionData::Empty, device).await.ok()??;
    Some(soap::extract_tag(&body, "CurrentTransportState").and_then(|s| TransportState::from_upnp(&s)))
}

async fn poll_volume(device: &DlnaDevice, http: &Client) -> Option<i32> {
    let service = device.service(UPNP_RC_SERVICE_TYPE)?;
    let body = service.control(http, "GetVolume", ActionData::Empty, device).await.ok()??;
    let raw: i32 = soap::extract_tag(&body, "CurrentVolume")?.parse().ok()?;
    Some(device_volume_to_percent(raw, device.volume_min, device.volume_max))
}

async fn poll_mute(device: &DlnaDevice, http: &Client) -> Option<bool> {
    let service = device.service(UPNP_RC_SERVICE_TYPE)?;
    let body = service.control(http, "GetMute", ActionData::Empty, device).await.ok()??;
    Some(soap::extract_tag(&body, "CurrentMute")?.trim() == "1")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_timedelta_round_trips() {
        assert_eq!(parse_timedelta("00:00:09"), Some(9_000));
        assert_eq!(parse_timedelta("01:02:03"), Some(3_723_000));
        assert_eq!(format_timedelta(3_723_000), "01:02:03");
        assert_eq!(format_timedelta(9_000), "00:00:09");
    }

    #[test]
    fn parse_timedelta_rejects_malformed_input() {
        assert_eq!(parse_timedelta("not-a-time"), None);
        assert_eq!(parse_timedelta("00:00"), None);
    }

    #[test]
    fn volume_round_trips_through_device_scale() {
        // device range 0..=65535 step 256, Plex-facing 0..=100.
        let pct = device_volume_to_percent(32768, 0, 65535);
        assert_eq!(pct, 50);
        let raw = percent_to_device_volume(50, 0, 65535, 256);
        assert!((raw - 32768).abs() <= 256);
    }

    #[test]
    fn volume_zero_and_hundred_are_exact_bounds() {
        assert_eq!(device_volume_to_percent(0, 0, 100), 0);
        assert_eq!(device_volume_to_percent(100, 0, 100), 100);
        assert_eq!(percent_to_device_volume(0, 0, 100, 1), 0);
        assert_eq!(percent_to_device_volume(100, 0, 100, 1), 100);
    }

    #[test]
    fn change_session_is_all_or_nothing_visible_as_one_set() {
        let mut state = DlnaState::default();
        let mut session = ChangeSession::new(&mut state);
        session.set_volume(10);
        session.set_muted(true);
        session.set_volume(10); // no-op, same value
        let set = session.close();
        assert_eq!(set.changes.len(), 2);
        assert_eq!(state.volume, 10);
        assert!(state.muted);
    }

    #[test]
    fn empty_change_session_produces_no_changes() {
        let mut state = DlnaState::default();
        let session = ChangeSession::new(&mut state);
        assert!(session.close().is_empty());
    }

    #[test]
    fn plex_state_mapping_matches_table() {
        assert_eq!(TransportState::Playing.plex_state(), "playing");
        assert_eq!(TransportState::Transitioning.plex_state(), "playing");
        assert_eq!(TransportState::Paused.plex_state(), "paused");
        assert_eq!(TransportState::Stopped.plex_state(), "stopped");
        assert_eq!(TransportState::NoMediaPresent.plex_state(), "stopped");
    }
}

//! Translates Plex playback commands into UPnP actions and UPnP state
//! changes into Plex timeline pushes, grounded on
//! `original_source/plex/adapters.py::PlexDlnaAdapter`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{Mutex, Notify};

use crate::error::{QueueError, SoapError};
use crate::plex::play_queue::{PlayQueue, RepeatMode, Track, TrackInfo};
use crate::plex::plex_lib::PlexLib;
use crate::state::{percent_to_device_volume, ChangeSet, FieldChange, StateHandle, TransportState};
use crate::upnp::device::{ActionData, DlnaDevice, UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE};

/// A field name a waiter cares about, matching the original's
/// `interesting_fields` strings. An empty `Vec` on the waiter means "any
/// change" (the original's falsy-list shortcut).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitField {
    State,
    Uri,
    Elapsed,
    ElapsedJump,
    Volume,
}

struct Waiter {
    notify: Arc<Notify>,
    interesting_fields: Vec<WaitField>,
}

const MAX_WAITERS: usize = 3;

fn change_contains(set: &ChangeSet, field: WaitField) -> bool {
    set.changes.iter().any(|c| {
        matches!(
            (field, c),
            (WaitField::State, FieldChange::State(_, _))
                | (WaitField::Uri, FieldChange::Uri(_, _))
                | (WaitField::Elapsed, FieldChange::Elapsed(_, _))
                | (WaitField::Volume, FieldChange::Volume(_, _))
        )
    })
}

fn elapsed_jump(set: &ChangeSet) -> bool {
    set.changes.iter().any(|c| match c {
        FieldChange::Elapsed(old, new) => !(0..=1000).contains(&(new - old)),
        _ => false,
    })
}

fn elapsed_change(set: &ChangeSet) -> Option<(i64, i64)> {
    set.changes.iter().find_map(|c| match c {
        FieldChange::Elapsed(old, new) => Some((*old, *new)),
        _ => None,
    })
}

fn state_change(set: &ChangeSet) -> Option<(Option<TransportState>, Option<TransportState>)> {
    set.changes.iter().find_map(|c| match c {
        FieldChange::State(old, new) => Some((*old, *new)),
        _ => None,
    })
}

fn uri_changed(set: &ChangeSet) -> bool {
    set.changes.iter().any(|c| matches!(c, FieldChange::Uri(_, _)))
}

/// Pure auto-next decision, grounded on `check_auto_next`. `current_uri`
/// reflects state *before* this change set was applied (the original reads
/// `self.state.current_uri`/`.elapsed` which by this point already carry the
/// new values for fields the session just wrote — except `current_uri`, read
/// before the session closes).
///
/// The two trigger branches use different duration sources, matching the
/// original: the continuing-PLAYING branch uses the Plex queue's reported
/// `current_track_duration`, while the PLAYING→STOPPED branch uses the live
/// device-polled `device_track_duration` (`self.state.current_track_duration`
/// in the original), since the device's own transport can disagree with
/// Plex's metadata about a track's length.
pub fn should_auto_next(
    current_uri_is_set: bool,
    current_track_duration: Option<i64>,
    device_track_duration: Option<i64>,
    elapsed_after: i64,
    set: &ChangeSet,
) -> bool {
    let state_changed = state_change(set).is_some();
    let uri_did_change = uri_changed(set);

    if current_uri_is_set && !state_changed && !uri_did_change {
        if let (Some(duration), Some((old_elapsed, new_elapsed))) = (current_track_duration, elapsed_change(set)) {
            let end_of_track = new_elapsed == 0 && old_elapsed > 0 && old_elapsed <= duration && duration - old_elapsed <= 2000;
            let advanced_past_end =
                new_elapsed > old_elapsed && (duration / 1000) * 1000 <= new_elapsed && new_elapsed <= duration;
            if end_of_track || advanced_past_end {
                return true;
            }
        }
        return false;
    }

    if !uri_did_change {
        if let Some((Some(TransportState::Playing), Some(TransportState::Stopped))) = state_change(set) {
            if let Some(duration) = device_track_duration {
                if duration - elapsed_after <= 1 {
                    return true;
                }
            }
        }
    }
    false
}

pub struct PlexDlnaAdapter {
    device: Arc<DlnaDevice>,
    http: Client,
    plex_lib: Mutex<PlexLib>,
    queue: Mutex<Option<PlayQueue>>,
    state: Arc<StateHandle>,
    shuffle: AtomicI32,
    plex_bind_token: Mutex<Option<String>>,
    waiters: Mutex<VecDeque<Waiter>>,
    no_notice: AtomicBool,
    current_track_info: Mutex<Option<TrackInfo>>,
}

impl PlexDlnaAdapter {
    pub fn new(device: Arc<DlnaDevice>, http: Client, state: Arc<StateHandle>, plex_bind_token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            device,
            http,
            plex_lib: Mutex::new(PlexLib::default()),
            queue: Mutex::new(None),
            state,
            shuffle: AtomicI32::new(0),
            plex_bind_token: Mutex::new(plex_bind_token),
            waiters: Mutex::new(VecDeque::new()),
            no_notice: AtomicBool::new(false),
            current_track_info: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &DlnaDevice {
        &self.device
    }

    pub async fn update_plex_lib(&self, query: &std::collections::HashMap<String, String>) {
        self.plex_lib.lock().await.update(query);
    }

    pub async fn plex_lib_snapshot(&self) -> PlexLib {
        self.plex_lib.lock().await.clone()
    }

    async fn avt_control(&self, action: &str, data: ActionData) -> Result<Option<String>, SoapError> {
        let service = self.device.service(UPNP_AVT_SERVICE_TYPE).ok_or_else(|| SoapError::NoSuchAction {
            action: action.to_string(),
            service_type: UPNP_AVT_SERVICE_TYPE.to_string(),
        })?;
        service.control(&self.http, action, data, &self.device).await
    }

    async fn rc_control(&self, action: &str, data: ActionData) -> Result<Option<String>, SoapError> {
        let service = self.device.service(UPNP_RC_SERVICE_TYPE).ok_or_else(|| SoapError::NoSuchAction {
            action: action.to_string(),
            service_type: UPNP_RC_SERVICE_TYPE.to_string(),
        })?;
        service.control(&self.http, action, data, &self.device).await
    }

    pub async fn play_media(
        &self,
        container_key: String,
        key: Option<&str>,
        offset_ms: i64,
        paused: bool,
        query: &std::collections::HashMap<String, String>,
    ) -> Result<(), QueueError> {
        self.plex_lib.lock().await.update(query);
        self.state.update(None, Some(None), None);
        let plex_lib = self.plex_lib.lock().await.clone();
        let mut queue = PlayQueue::new(container_key, plex_lib);
        queue.get_info(&self.http).await?;
        if let Some(key) = key {
            queue.select_track_key(&self.http, key).await?;
        }
        *self.queue.lock().await = Some(queue);
        self.play_selected_queue_item(offset_ms, paused).await
    }

    /// Re-pages the current queue around a different `playQueueID` pushed
    /// from the Plex client, and wakes any pollers blocked on the stale one.
    pub async fn refresh_queue(&self, play_queue_id: i64) -> Result<(), QueueError> {
        let mut queue_guard = self.queue.lock().await;
        let queue = queue_guard.as_mut().ok_or(QueueError::SelectionLost)?;
        queue.refresh_queue(&self.http, play_queue_id).await?;
        drop(queue_guard);
        self.wake_all_waiters().await;
        Ok(())
    }

    pub async fn play_selected_queue_item(&self, offset_ms: i64, paused: bool) -> Result<(), QueueError> {
        self.state.update(Some(TransportState::Transitioning), None, None);
        self.state.request_check_all();

        let mut queue_guard = self.queue.lock().await;
        let queue = queue_guard.as_mut().ok_or(QueueError::SelectionLost)?;
        let track = queue.selected_track(&self.http).await?;
        let url = queue.url_for_track(&track);
        let track_info = queue.get_track_info(&track);
        drop(queue_guard);

        if let Some(url) = url {
            let current = self.state.snapshot().await.current_uri;
            if current.as_deref() == Some(url.as_str()) {
                self.state.update(None, Some(None), None);
            }
            let _ = self.avt_control("SetAVTransportURI", ActionData::Scalar(url)).await;
        }
        *self.current_track_info.lock().await = track_info;

        if offset_ms != 0 {
            let _ = self.avt_control("Seek", ActionData::Scalar(crate::state::format_timedelta(offset_ms))).await;
        }
        if paused {
            self.pause().await;
        } else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.state.snapshot().await.state != Some(TransportState::Playing) {
                self.play().await;
            }
        }
        Ok(())
    }

    pub async fn play(&self) {
        let _ = self.avt_control("Play", ActionData::Empty).await;
        self.state.request_check_all();
    }

    pub async fn pause(&self) {
        self.state.update(Some(TransportState::Paused), None, None);
        let _ = self.avt_control("Pause", ActionData::Empty).await;
        self.state.request_check_all();
    }

    pub async fn stop(&self) {
        self.state.update(Some(TransportState::Stopped), Some(None), None);
        *self.current_track_info.lock().await = None;
        let _ = self.avt_control("Stop", ActionData::Empty).await;
        self.state.request_check_all();
    }

    pub async fn seek(&self, offset_ms: i64) {
        let _ = self.avt_control("Seek", ActionData::Scalar(crate::state::format_timedelta(offset_ms))).await;
    }

    pub async fn prev(self: &Arc<Self>) -> Result<(), QueueError> {
        let elapsed = self.state.snapshot().await.elapsed_ms;
        if elapsed <= 5_000 {
            self.next(true).await
        } else {
            self.seek(0).await;
            Ok(())
        }
    }

    pub async fn next(self: &Arc<Self>, revert: bool) -> Result<(), QueueError> {
        let direction: i64 = if revert { -1 } else { 1 };
        let shuffle = self.shuffle.load(Ordering::SeqCst);

        let mut queue_guard = self.queue.lock().await;
        let queue = queue_guard.as_mut().ok_or(QueueError::SelectionLost)?;
        let total = queue.total_count(&self.http).await?;
        let current_offset = queue.selected_offset(&self.http).await?;
        let next_offset = if shuffle > 0 && queue.allow_shuffle(&self.http).await? {
            let total = total.unwrap_or(1).max(1);
            (rand::random::<u64>() % total.max(1) as u64) as i64
        } else {
            current_offset + direction
        };
        let out_of_range = match total {
            Some(total) => next_offset >= total || next_offset < 0,
            None => next_offset < 0,
        };
        drop(queue_guard);

        if out_of_range {
            self.stop().await;
            return Ok(());
        }

        self.state.update(Some(TransportState::Transitioning), None, None);
        {
            let mut queue_guard = self.queue.lock().await;
            let queue = queue_guard.as_mut().ok_or(QueueError::SelectionLost)?;
            queue.set_selected_offset(&self.http, next_offset).await?;
        }
        self.play_selected_queue_item(0, false).await
    }

    pub async fn skip_to_track(&self, key: &str) -> Result<(), QueueError> {
        self.state.update(Some(TransportState::Transitioning), None, None);
        {
            let mut queue_guard = self.queue.lock().await;
            let queue = queue_guard.as_mut().ok_or(QueueError::SelectionLost)?;
            queue.select_track_key(&self.http, key).await?;
        }
        self.play_selected_queue_item(0, false).await
    }

    pub fn set_shuffle(&self, value: i32) {
        self.shuffle.store(value, Ordering::SeqCst);
    }

    pub async fn set_repeat(&self, mode: RepeatMode) {
        if let Some(queue) = self.queue.lock().await.as_mut() {
            queue.repeat = mode;
        }
    }

    pub async fn set_volume(&self, volume_pct: i32) {
        let device_volume = percent_to_device_volume(volume_pct, self.device.volume_min, self.device.volume_max, self.device.volume_step);
        let _ = self.rc_control("SetVolume", ActionData::Scalar(device_volume.to_string())).await;
        self.state.request_check_all();
    }

    /// The GENA NOTIFY handler: folds `TransportState`/`AVTransportURI`/
    /// `RelativeTimePosition` from a `LastChange` event into the engine.
    pub fn update_state(&self, state: Option<&str>, uri: Option<&str>, position: Option<&str>) {
        if state.is_none() && uri.is_none() && position.is_none() {
            tracing::debug!("ignoring GENA notice with no info");
            return;
        }
        let parsed_state = state.and_then(TransportState::from_upnp);
        let parsed_position = position.and_then(crate::state::parse_timedelta);
        self.state.update(parsed_state, uri.map(|s| Some(s.to_string())), parsed_position);
    }

    pub async fn plex_state(&self) -> Option<&'static str> {
        self.state.snapshot().await.state.map(|s| s.plex_state())
    }

    /// Called by the state engine's change-notification consumer: decides
    /// whether this `ChangeSet` should trigger an auto-advance instead of
    /// (or in addition to) being forwarded to waiters/subscribers.
    pub async fn handle_change(self: &Arc<Self>, set: ChangeSet) -> bool {
        if self.queue.lock().await.is_none() {
            self.wake_waiters(&set).await;
            return false;
        }
        let snapshot = self.state.snapshot().await;
        let current_track_duration = self.current_track_info.lock().await.as_ref().map(|t| t.duration);
        let device_track_duration = (snapshot.duration_ms > 0).then_some(snapshot.duration_ms);
        let triggers = should_auto_next(
            snapshot.current_uri.is_some(),
            current_track_duration,
            device_track_duration,
            snapshot.elapsed_ms,
            &set,
        );
        if triggers {
            self.no_notice.store(true, Ordering::SeqCst);
            self.state.update(Some(TransportState::Transitioning), Some(None), None);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.auto_next().await;
                this.no_notice.store(false, Ordering::SeqCst);
            });
            return true;
        }
        self.wake_waiters(&set).await;
        false
    }

    async fn auto_next(self: &Arc<Self>) {
        let repeat = self.queue.lock().await.as_ref().map(|q| q.repeat).unwrap_or(RepeatMode::Off);
        match repeat {
            RepeatMode::RepeatOne => {
                let _ = self.play_selected_queue_item(0, false).await;
            }
            RepeatMode::RepeatAll => {
                let mut queue_guard = self.queue.lock().await;
                let Some(queue) = queue_guard.as_mut() else { return };
                let total = queue.total_count(&self.http).await.ok().flatten();
                let offset = queue.selected_offset(&self.http).await.unwrap_or(0);
                let shuffle = self.shuffle.load(Ordering::SeqCst);
                let at_end = total.map(|t| offset >= t - 1).unwrap_or(false);
                drop(queue_guard);
                if at_end && shuffle == 0 {
                    if let Some(queue) = self.queue.lock().await.as_mut() {
                        let _ = queue.set_selected_offset(&self.http, 0).await;
                    }
                    let _ = self.play_selected_queue_item(0, false).await;
                } else {
                    let _ = self.next(false).await;
                }
            }
            RepeatMode::Off => {
                let _ = self.next(false).await;
            }
        }
    }

    pub fn is_no_notice(&self) -> bool {
        self.no_notice.load(Ordering::SeqCst)
    }

    /// Registers interest in the next change matching `interesting_fields`
    /// (empty = any change). When the queue already holds `MAX_WAITERS`
    /// entries, this call's own waiter is woken immediately, unsatisfied,
    /// instead of being enqueued — matching the original's drop-newest
    /// behavior under pressure.
    pub async fn wait_for_change(&self, timeout: Duration, interesting_fields: Vec<WaitField>) {
        let notify = Arc::new(Notify::new());
        let waiter = Waiter { notify: Arc::clone(&notify), interesting_fields };

        let mut waiters = self.waiters.lock().await;
        waiters.push_back(waiter);
        if waiters.len() > MAX_WAITERS {
            if let Some(evicted) = waiters.pop_back() {
                evicted.notify.notify_one();
            }
        }
        drop(waiters);

        let _ = tokio::time::timeout(timeout, notify.notified()).await;
    }

    async fn wake_waiters(&self, set: &ChangeSet) {
        let mut waiters = self.waiters.lock().await;
        waiters.retain(|w| {
            let wake = w.interesting_fields.is_empty()
                || w.interesting_fields.iter().any(|f| match f {
                    WaitField::ElapsedJump => elapsed_jump(set),
                    other => change_contains(set, *other),
                });
            if wake {
                w.notify.notify_one();
            }
            !wake
        });
    }

    /// Drains every pending waiter unconditionally, used when a queue
    /// refresh invalidates whatever those waiters were waiting on.
    pub async fn wake_all_waiters(&self) {
        let mut waiters = self.waiters.lock().await;
        for w in waiters.drain(..) {
            w.notify.notify_one();
        }
    }

    pub async fn plex_bind_token(&self) -> Option<String> {
        self.plex_bind_token.lock().await.clone()
    }

    pub async fn set_plex_bind_token(&self, token: String) {
        *self.plex_bind_token.lock().await = Some(token);
    }

    /// Assembles the full attribute set a `Timeline` element carries: player
    /// transport/volume state, the current track's identity within its play
    /// queue, and the bound Plex Media Server's address — in that order, so
    /// callers building XML get a stable attribute ordering. `None` when
    /// there's nothing playing (`plex_state` is unset), matching the
    /// original's `get_state` short-circuit.
    pub async fn get_state(&self) -> Option<Vec<(String, String)>> {
        let snapshot = self.state.snapshot().await;
        let plex_state = snapshot.state.map(|s| s.plex_state())?;

        let mut attrs = vec![
            ("state".to_string(), plex_state.to_string()),
            ("time".to_string(), snapshot.elapsed_ms.to_string()),
            ("duration".to_string(), snapshot.duration_ms.to_string()),
            (
                "volume".to_string(),
                crate::state::device_volume_to_percent(snapshot.volume, self.device.volume_min, self.device.volume_max).to_string(),
            ),
            ("mute".to_string(), if snapshot.muted { "1" } else { "0" }.to_string()),
            ("shuffle".to_string(), self.shuffle.load(Ordering::SeqCst).to_string()),
            (
                "repeat".to_string(),
                match self.queue.lock().await.as_ref().map(|q| q.repeat).unwrap_or(RepeatMode::Off) {
                    RepeatMode::Off => "0",
                    RepeatMode::RepeatOne => "1",
                    RepeatMode::RepeatAll => "2",
                }
                .to_string(),
            ),
        ];

        if let Some(track_info) = self.current_track_info.lock().await.as_ref() {
            attrs.push(("key".to_string(), track_info.key.clone()));
            attrs.push(("ratingKey".to_string(), track_info.rating_key.clone()));
            attrs.push(("containerKey".to_string(), track_info.container_key.clone()));
            attrs.push(("playQueueID".to_string(), track_info.play_queue_id.to_string()));
            attrs.push(("playQueueVersion".to_string(), track_info.play_queue_version.to_string()));
            attrs.push(("playQueueItemID".to_string(), track_info.play_queue_item_id.to_string()));
        }

        let plex_lib = self.plex_lib.lock().await;
        attrs.push(("protocol".to_string(), plex_lib.protocol.clone()));
        attrs.push(("address".to_string(), plex_lib.address.clone()));
        attrs.push(("port".to_string(), plex_lib.port.to_string()));
        attrs.push(("machineIdentifier".to_string(), plex_lib.machine_id.clone()));

        Some(attrs)
    }

    /// The subset of `get_state()` a server-side `/:/timeline` push cares
    /// about, plus the bind token — grounded on `notify_server_device`'s
    /// own narrower attribute set in the original.
    pub async fn get_pms_state(&self) -> Option<Vec<(String, String)>> {
        const SERVER_FIELDS: &[&str] =
            &["state", "ratingKey", "key", "time", "duration", "playQueueItemID", "shuffle", "repeat", "containerKey"];
        let attrs = self.get_state().await?;
        let mut filtered: Vec<(String, String)> =
            attrs.into_iter().filter(|(k, _)| SERVER_FIELDS.contains(&k.as_str())).collect();
        if let Some(token) = self.plex_bind_token().await {
            filtered.push(("X-Plex-Token".to_string(), token));
        }
        Some(filtered)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::state::FieldChange;

    fn set_with(changes: Vec<FieldChange>) -> ChangeSet {
        ChangeSet { changes }
    }

    #[test]
    fn auto_next_triggers_at_end_of_track() {
        let set = set_with(vec![FieldChange::Elapsed(9_000, 0)]);
        assert!(should_auto_next(true, Some(10_000), Some(10_000), 0, &set));
    }

    #[test]
    fn auto_next_triggers_when_advanced_past_truncated_duration() {
        let set = set_with(vec![FieldChange::Elapsed(9_500, 9_900)]);
        assert!(should_auto_next(true, Some(10_000), Some(10_000), 9_900, &set));
    }

    #[test]
    fn auto_next_does_not_trigger_on_ordinary_progress() {
        let set = set_with(vec![FieldChange::Elapsed(1_000, 2_000)]);
        assert!(!should_auto_next(true, Some(10_000), Some(10_000), 2_000, &set));
    }

    #[test]
    fn auto_next_triggers_on_playing_to_stopped_near_end() {
        let set = set_with(vec![FieldChange::State(Some(TransportState::Playing), Some(TransportState::Stopped))]);
        assert!(should_auto_next(true, Some(10_000), Some(10_000), 10_000, &set));
    }

    #[test]
    fn auto_next_playing_to_stopped_uses_device_duration_not_plex_duration() {
        let set = set_with(vec![FieldChange::State(Some(TransportState::Playing), Some(TransportState::Stopped))]);
        // Plex metadata says 10s but the device itself reports 5s; the
        // stopped-near-end check must key off the device's duration.
        assert!(should_auto_next(true, Some(10_000), Some(5_000), 5_000, &set));
        assert!(!should_auto_next(true, Some(10_000), Some(5_000), 2_000, &set));
    }

    #[test]
    fn auto_next_suppressed_when_uri_changed() {
        let set = set_with(vec![
            FieldChange::Uri(None, Some("x".into())),
            FieldChange::Elapsed(9_000, 0),
        ]);
        assert!(!should_auto_next(true, Some(10_000), Some(10_000), 0, &set));
    }

    #[tokio::test]
    async fn fourth_waiter_is_woken_without_being_satisfied() {
        let waiters: Mutex<VecDeque<Waiter>> = Mutex::new(VecDeque::new());
        for _ in 0..3 {
            let notify = Arc::new(Notify::new());
            waiters.lock().await.push_back(Waiter { notify, interesting_fields: vec![] });
        }
        let fourth_notify = Arc::new(Notify::new());
        {
            let mut w = waiters.lock().await;
            w.push_back(Waiter { notify: Arc::clone(&fourth_notify), interesting_fields: vec![] });
            assert_eq!(w.len(), 4);
            if w.len() > MAX_WAITERS {
                if let Some(evicted) = w.pop_back() {
                    evicted.notify.notify_one();
                }
            }
            assert_eq!(w.len(), 3);
        }
        tokio::time::timeout(Duration::from_millis(50), fourth_notify.notified())
            .await
            .expect("evicted waiter should be woken promptly");
    }
}

//! Plex play queue: paging through `/playQueues/{id}` windows and tracking
//! the selected item, grounded on `original_source/plex/play_queue.py`.

use reqwest::Client;
use serde::Deserialize;

use crate::error::QueueError;
use crate::plex::plex_lib::PlexLib;

#[derive(Debug, Clone, Deserialize)]
pub struct PartInfo {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    #[serde(rename = "Part", default)]
    pub part: Vec<PartInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Track {
    pub duration: i64,
    pub key: String,
    #[serde(rename = "ratingKey")]
    pub rating_key: String,
    #[serde(rename = "playQueueItemID")]
    pub play_queue_item_id: i64,
    #[serde(rename = "Media", default)]
    pub media: Vec<MediaInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct MediaContainer {
    #[serde(rename = "playQueueID")]
    play_queue_id: i64,
    #[serde(rename = "playQueueVersion")]
    play_queue_version: i64,
    #[serde(rename = "playQueueSelectedItemID")]
    play_queue_selected_item_id: i64,
    #[serde(rename = "playQueueSelectedItemOffset")]
    play_queue_selected_item_offset: i64,
    #[serde(rename = "playQueueTotalCount", default)]
    play_queue_total_count: Option<i64>,
    #[serde(rename = "allowShuffle", default)]
    allow_shuffle: Option<bool>,
    #[serde(rename = "Metadata", default)]
    metadata: Vec<Track>,
}

#[derive(Debug, Deserialize)]
struct MediaContainerEnvelope {
    #[serde(rename = "MediaContainer")]
    media_container: MediaContainer,
}

/// Surfaced to Plex clients as part of the player's timeline/state.
pub struct TrackInfo {
    pub duration: i64,
    pub key: String,
    pub rating_key: String,
    pub container_key: String,
    pub play_queue_id: i64,
    pub play_queue_version: i64,
    pub play_queue_item_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    Off,
    RepeatOne,
    RepeatAll,
}

impl RepeatMode {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::RepeatOne,
            2 => Self::RepeatAll,
            _ => Self::Off,
        }
    }
}

pub struct PlayQueue {
    container_key: String,
    plex_lib: PlexLib,
    info: Option<MediaContainer>,
    start_offset: Option<i64>,
    pub repeat: RepeatMode,
}

impl PlayQueue {
    pub fn new(container_key: String, plex_lib: PlexLib) -> Self {
        Self {
            container_key,
            plex_lib,
            info: None,
            start_offset: None,
            repeat: RepeatMode::Off,
        }
    }

    async fn fetch(http: &Client, url: &str) -> Result<MediaContainer, QueueError> {
        let response = http.get(url).header("Accept", "application/json").send().await?;
        response.error_for_status_ref().map_err(|e| QueueError::Request(e))?;
        let envelope: MediaContainerEnvelope = response.json().await?;
        Ok(envelope.media_container)
    }

    /// Loads the queue window on first use, then locates the selected
    /// item's offset within the window to establish `start_offset`.
    pub async fn get_info(&mut self, http: &Client) -> Result<&MediaContainer, QueueError> {
        if self.info.is_none() {
            let url = self.plex_lib.build_url(&self.container_key, true);
            let info = Self::fetch(http, &url).await?;
            let selected_id = info.play_queue_selected_item_id;
            let selected_offset = info.play_queue_selected_item_offset;
            if let Some(idx) = info.metadata.iter().position(|t| t.play_queue_item_id == selected_id) {
                self.start_offset = Some(selected_offset - idx as i64);
            }
            self.info = Some(info);
        }
        Ok(self.info.as_ref().expect("just populated"))
    }

    fn last_offset(&self) -> Option<i64> {
        let start = self.start_offset?;
        let info = self.info.as_ref()?;
        Some(start + info.metadata.len() as i64 - 1)
    }

    /// `None` means an unlimited (live/radio-style) queue. A reported count
    /// of `0` means the same thing — Plex omits the field entirely for some
    /// radio/live queues but sends a literal `0` for others.
    pub async fn total_count(&mut self, http: &Client) -> Result<Option<i64>, QueueError> {
        Ok(self.get_info(http).await?.play_queue_total_count.filter(|&t| t != 0))
    }

    pub async fn selected_offset(&mut self, http: &Client) -> Result<i64, QueueError> {
        Ok(self.get_info(http).await?.play_queue_selected_item_offset)
    }

    pub async fn allow_shuffle(&mut self, http: &Client) -> Result<bool, QueueError> {
        let total = self.total_count(http).await?;
        let info = self.get_info(http).await?;
        Ok(info.allow_shuffle.unwrap_or_else(|| total.is_some()))
    }

    /// Fetches one more page of the queue window, before or after the
    /// current bounds, stitching it onto the in-memory `Metadata` list.
    pub async fn more(&mut self, http: &Client, after: bool) -> Result<(), QueueError> {
        self.get_info(http).await?;
        let total = self.total_count(http).await?;
        let start_offset = self.start_offset.unwrap_or(0);
        let last_offset = self.last_offset().unwrap_or(start_offset);

        let base_url = self.plex_lib.build_url(&self.container_key, true);
        let mut url = url::Url::parse(&base_url).map_err(|_| QueueError::SelectionLost)?;
        {
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !matches!(k.as_ref(), "center" | "includeBefore" | "includeAfter"))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();

            if after {
                if let Some(total) = total {
                    if last_offset >= total - 1 {
                        return Ok(());
                    }
                }
                let track = self.track(http, start_offset + self.info.as_ref().unwrap().metadata.len() as i64 - 1).await?;
                pairs.push(("includeAfter".to_string(), "1".to_string()));
                pairs.push(("center".to_string(), track.play_queue_item_id.to_string()));
            } else {
                if start_offset <= 1 {
                    return Ok(());
                }
                let track = self.track(http, start_offset).await?;
                pairs.push(("includeBefore".to_string(), "1".to_string()));
                pairs.push(("center".to_string(), track.play_queue_item_id.to_string()));
            }
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }

        let page = Self::fetch(http, url.as_str()).await?;
        let info = self.info.as_mut().expect("populated above");
        if after {
            info.metadata.extend(page.metadata);
        } else {
            let prepended = page.metadata.len() as i64;
            let mut merged = page.metadata;
            merged.extend(info.metadata.drain(..));
            info.metadata = merged;
            self.start_offset = Some(start_offset - prepended);
        }
        Ok(())
    }

    /// Resolves a global queue offset to a track, paging the window as
    /// needed. Recurses once per page fetch, mirroring the original.
    pub async fn track(&mut self, http: &Client, offset: i64) -> Result<Track, QueueError> {
        self.get_info(http).await?;
        if let Some(total) = self.total_count(http).await? {
            if offset < 0 || offset >= total {
                return Err(QueueError::OutOfRange { offset, total });
            }
        }
        loop {
            let start = self.start_offset.unwrap_or(0);
            let last = self.last_offset().unwrap_or(start);
            if offset > last {
                self.more(http, true).await?;
                continue;
            }
            if offset < start {
                self.more(http, false).await?;
                continue;
            }
            let local = (offset - start) as usize;
            return self
                .info
                .as_ref()
                .and_then(|i| i.metadata.get(local))
                .cloned()
                .ok_or(QueueError::SelectionLost);
        }
    }

    pub async fn selected_track(&mut self, http: &Client) -> Result<Track, QueueError> {
        let offset = self.selected_offset(http).await?;
        self.track(http, offset).await
    }

    pub async fn set_selected_offset(&mut self, http: &Client, offset: i64) -> Result<(), QueueError> {
        let total = self.total_count(http).await?;
        if let Some(total) = total {
            if offset < 0 || offset >= total {
                return Err(QueueError::OutOfRange { offset, total });
            }
        }
        let track = self.track(http, offset).await?;
        let info = self.info.as_mut().expect("track() populates info");
        info.play_queue_selected_item_offset = offset;
        info.play_queue_selected_item_id = track.play_queue_item_id;
        Ok(())
    }

    pub async fn select_track_key(&mut self, http: &Client, key: &str) -> Result<(), QueueError> {
        self.get_info(http).await?;
        let start_offset = self.start_offset.unwrap_or(0);
        if let Some(idx) = self.info.as_ref().unwrap().metadata.iter().position(|t| t.key == key) {
            self.set_selected_offset(http, start_offset + idx as i64).await?;
        }
        Ok(())
    }

    /// The URL carries the Plex token — media part URLs are otherwise
    /// unsigned and the renderer can't authenticate separately.
    pub fn url_for_track(&self, track: &Track) -> Option<String> {
        let part_key = track.media.first()?.part.first()?.key.clone();
        Some(self.plex_lib.build_url(&part_key, true))
    }

    pub fn get_track_info(&self, track: &Track) -> Option<TrackInfo> {
        let info = self.info.as_ref()?;
        Some(TrackInfo {
            duration: track.duration,
            key: track.key.clone(),
            rating_key: track.rating_key.clone(),
            container_key: format!("/playQueues/{}", info.play_queue_id),
            play_queue_id: info.play_queue_id,
            play_queue_version: info.play_queue_version,
            play_queue_item_id: track.play_queue_item_id,
        })
    }

    /// Re-fetches the queue under a new `playQueueID` (e.g. after a Plex
    /// client reshuffles/reorders), preserving the currently selected item
    /// by id and recomputing its offset in the new window.
    pub async fn refresh_queue(&mut self, http: &Client, play_queue_id: i64) -> Result<(), QueueError> {
        let current_info = self.info.as_ref().ok_or(QueueError::SelectionLost)?;
        if play_queue_id != current_info.play_queue_id {
            self.container_key = self
                .container_key
                .replacen(&current_info.play_queue_id.to_string(), &play_queue_id.to_string(), 1);
        }
        let old_selected_item_id = current_info.play_queue_selected_item_id;

        let url = self.plex_lib.build_url(&self.container_key, true);
        let new_info = Self::fetch(http, &url).await?;

        let mut new_available_offset = None;
        let mut start_offset = None;
        for (idx, track) in new_info.metadata.iter().enumerate() {
            if track.play_queue_item_id == old_selected_item_id {
                new_available_offset = Some(idx as i64);
            }
            if track.play_queue_item_id == new_info.play_queue_selected_item_id {
                start_offset = Some(new_info.play_queue_selected_item_offset - idx as i64);
            }
            if new_available_offset.is_some() && start_offset.is_some() {
                break;
            }
        }
        let (new_available_offset, start_offset) = new_available_offset
            .zip(start_offset)
            .ok_or(QueueError::SelectionLost)?;

        let mut new_info = new_info;
        new_info.play_queue_selected_item_id = old_selected_item_id;
        new_info.play_queue_selected_item_offset = new_available_offset + start_offset;
        self.start_offset = Some(start_offset);
        self.info = Some(new_info);
        Ok(())
    }
}

impl Clone for Track {
    fn clone(&self) -> Self {
        Self {
            duration: self.duration,
            key: self.key.clone(),
            rating_key: self.rating_key.clone(),
            play_queue_item_id: self.play_queue_item_id,
            media: self.media.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn sample_container(selected_offset: i64, total: Option<i64>) -> MediaContainer {
        MediaContainer {
            play_queue_id: 7,
            play_queue_version: 1,
            play_queue_selected_item_id: 100,
            play_queue_selected_item_offset: selected_offset,
            play_queue_total_count: total,
            allow_shuffle: Some(true),
            metadata: vec![
                Track { duration: 10_000, key: "/library/metadata/1".into(), rating_key: "1".into(), play_queue_item_id: 100, media: vec![] },
                Track { duration: 20_000, key: "/library/metadata/2".into(), rating_key: "2".into(), play_queue_item_id: 101, media: vec![] },
            ],
        }
    }

    #[tokio::test]
    async fn total_count_of_zero_is_treated_as_unbounded() {
        let http = Client::new();
        let mut q = PlayQueue {
            container_key: "/playQueues/7".into(),
            plex_lib: PlexLib::default(),
            info: Some(sample_container(0, Some(0))),
            start_offset: Some(0),
            repeat: RepeatMode::Off,
        };
        assert_eq!(q.total_count(&http).await.unwrap(), None);
    }

    #[test]
    fn last_offset_accounts_for_window_length() {
        let mut q = PlayQueue::new("/playQueues/7".into(), PlexLib::default());
        q.info = Some(sample_container(0, Some(2)));
        q.start_offset = Some(0);
        assert_eq!(q.last_offset(), Some(1));
    }

    #[test]
    fn get_track_info_surfaces_expected_fields() {
        let q_info = sample_container(0, Some(2));
        let q = PlayQueue {
            container_key: "/playQueues/7".into(),
            plex_lib: PlexLib::default(),
            info: Some(q_info),
            start_offset: Some(0),
            repeat: RepeatMode::Off,
        };
        let track = q.info.as_ref().unwrap().metadata[0].clone();
        let info = q.get_track_info(&track).unwrap();
        assert_eq!(info.duration, 10_000);
        assert_eq!(info.container_key, "/playQueues/7");
        assert_eq!(info.play_queue_item_id, 100);
    }

    #[test]
    fn url_for_track_carries_token() {
        let mut lib = PlexLib::default();
        lib.protocol = "http".into();
        lib.address = "10.0.0.5".into();
        lib.port = 32400;
        lib.token = "tok-123".into();
        let q = PlayQueue::new("/playQueues/7".into(), lib);
        let track = Track {
            duration: 10_000,
            key: "/library/metadata/1".into(),
            rating_key: "1".into(),
            play_queue_item_id: 100,
            media: vec![MediaInfo { part: vec![PartInfo { key: "/library/parts/1/file.mp3".into() }] }],
        };
        let url = q.url_for_track(&track).unwrap();
        assert!(url.contains("X-Plex-Token=tok-123"));
        assert!(url.starts_with("http://10.0.0.5:32400/library/parts/1/file.mp3"));
    }
}

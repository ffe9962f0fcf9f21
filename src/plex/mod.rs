//! Plex-facing half of the bridge: play queue paging, the PMS-bound
//! adapter, pin login, and timeline subscribe/push.

pub mod adapter;
pub mod pin_login;
pub mod play_queue;
pub mod plex_lib;
pub mod subscribe;

pub use adapter::{PlexDlnaAdapter, WaitField};
pub use play_queue::{PlayQueue, RepeatMode};
pub use plex_lib::PlexLib;
pub use subscribe::SubscribeManager;

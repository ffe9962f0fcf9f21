//! DLNA/UPnP-to-Plex bridge.
//!
//! Discovers UPnP AVTransport renderers on the LAN via SSDP, wraps each one
//! in a `PlexDlnaAdapter` that speaks the Plex remote-player HTTP protocol,
//! and advertises them over GDM so Plex clients pick them up as playback
//! targets alongside real Plex Media Server clients.

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================

// Deny truly dangerous patterns (these will fail the build)
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Note: clippy::pedantic, clippy::nursery, and clippy::cargo are NOT enabled
// because they have hundreds of existing violations. Enable incrementally.

pub mod config;
pub mod error;
pub mod gdm;
pub mod http;
pub mod lifecycle;
pub mod plex;
pub mod registry;
pub mod ssdp;
pub mod state;
pub mod upnp;

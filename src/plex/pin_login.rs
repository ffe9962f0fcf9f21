//! PIN-based Plex sign-in used by the bind page, grounded on
//! `original_source/plex/pin_login.py`.

use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::plex::subscribe::pms_header;
use crate::upnp::device::DlnaDevice;

const PINS_URL: &str = "https://plex.tv/api/v2/pins";

#[derive(Debug, Deserialize)]
struct Pin {
    #[serde(rename = "@code")]
    code: Option<String>,
    #[serde(rename = "@id")]
    id: Option<i64>,
    #[serde(rename = "@authToken")]
    auth_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("request to plex.tv failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed response from plex.tv: {0}")]
    Parse(#[from] quick_xml::DeError),
}

/// Requests a new 4-letter PIN from plex.tv; returns `(code, pin_id)`.
pub async fn get_pin(http: &Client, device: &DlnaDevice, config: &Config) -> Result<(String, i64), PinError> {
    let mut req = http.post(PINS_URL);
    for (k, v) in pms_header(device, config) {
        req = req.header(k, v);
    }
    let resp = req.send().await?.error_for_status()?;
    let body = resp.text().await?;
    let pin: Pin = quick_xml::de::from_str(&body)?;
    Ok((pin.code.unwrap_or_default(), pin.id.unwrap_or_default()))
}

/// Polls plex.tv for whether a PIN has been claimed; returns `None` until
/// the user completes the linking flow in their Plex account.
pub async fn check_pin(http: &Client, pin_id: i64, device: &DlnaDevice, config: &Config) -> Result<Option<String>, PinError> {
    let url = format!("{PINS_URL}/{pin_id}");
    let mut req = http.get(&url);
    for (k, v) in pms_header(device, config) {
        req = req.header(k, v);
    }
    let resp = req.send().await?.error_for_status()?;
    let body = resp.text().await?;
    let pin: Pin = quick_xml::de::from_str(&body)?;
    Ok(pin.auth_token.filter(|t| !t.is_empty()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn pin_without_auth_token_parses_as_none() {
        let xml = r#"<pin id="12345" code="ABCD"/>"#;
        let pin: Pin = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(pin.code.as_deref(), Some("ABCD"));
        assert_eq!(pin.id, Some(12345));
        assert!(pin.auth_token.is_none());
    }

    #[test]
    fn pin_with_auth_token_parses() {
        let xml = r#"<pin id="12345" code="ABCD" authToken="tok-xyz"/>"#;
        let pin: Pin = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(pin.auth_token.as_deref(), Some("tok-xyz"));
    }
}

//! SOAP 1.1 envelope construction and dispatch for UPnP control actions.

use std::time::Duration;

use reqwest::Client;

use crate::error::SoapError;

pub const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default argument values merged into a call when the action's SCPD
/// argument list names them and the caller omitted them.
pub fn default_action_data(name: &str) -> Option<&'static str> {
    match name {
        "InstanceID" => Some("0"),
        "Channel" => Some("Master"),
        "CurrentURIMetaData" => Some(""),
        "NextURIMetaData" => Some(""),
        "Unit" => Some("REL_TIME"),
        "Speed" => Some("1"),
        _ => None,
    }
}

/// Builds the SOAP envelope body for a UPnP action call. `fields` preserves
/// caller-supplied ordering; tag values are not escaped beyond what UPnP
/// actions typically carry (numeric/time strings, URLs).
pub fn build_envelope(action: &str, urn: &str, fields: &[(String, String)]) -> String {
    let mut body = String::new();
    for (tag, value) in fields {
        body.push_str(&format!("<{tag}>{value}</{tag}>"));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:{action} xmlns:u=\"{urn}\">\
         {body}</u:{action}></s:Body></s:Envelope>"
    )
}

/// POSTs a SOAP action and returns the raw response body. Non-2xx status
/// raises `SoapError::Http`; connect-refused style failures are mapped to
/// `SoapError::Connect` so callers can drive the per-device error count.
pub async fn post_action(
    http: &Client,
    control_url: &str,
    urn: &str,
    action: &str,
    envelope: String,
) -> Result<String, SoapError> {
    let response = http
        .post(control_url)
        .header("Content-Type", "text/xml; charset=utf-8")
        .header("SOAPACTION", format!("\"{}#{}\"", urn, action))
        .header("charset", "utf-8")
        .body(envelope)
        .timeout(SOAP_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() {
                SoapError::Connect(e)
            } else {
                SoapError::Request(e)
            }
        })?;

    if !response.status().is_success() {
        return Err(SoapError::Http(response.status()));
    }
    Ok(response.text().await?)
}

/// Extracts `<tag>value</tag>`, tolerating an optional namespace prefix
/// (`<u:Volume>` / `<Volume>`), the pattern the original's `xmltodict` +
/// namespace-stripping produces after flattening.
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"<(?:[^:>]+:)?{0}\b[^>]*>([^<]*)</(?:[^:>]+:)?{0}>",
        regex::escape(tag)
    );
    regex::Regex::new(&pattern)
        .ok()?
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// True when the SOAP response body carries a `UPnPError/errorDescription`
/// fault, which callers treat as a null result rather than an error.
pub fn extract_upnp_fault(xml: &str) -> Option<String> {
    extract_tag(xml, "errorDescription")
}

fn unescape_xml_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn extract_attr(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let pattern = format!(r#"<(?:[^:>]+:)?{0}\b[^>]*\b{1}="([^"]*)""#, regex::escape(tag), regex::escape(attr));
    regex::Regex::new(&pattern).ok()?.captures(xml).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}

/// Parses a GENA NOTIFY body's HTML-entity-escaped `LastChange` event into
/// the `(TransportState, AVTransportURI, RelativeTimePosition)` triple
/// `PlexDlnaAdapter::update_state` expects, matching the original's
/// `xml2dict` plus namespace-stripping flatten.
pub fn parse_last_change(body: &str) -> (Option<String>, Option<String>, Option<String>) {
    let Some(last_change) = extract_tag(body, "LastChange") else {
        return (None, None, None);
    };
    let unescaped = unescape_xml_entities(&last_change);
    let state = extract_attr(&unescaped, "TransportState", "val");
    let uri = extract_attr(&unescaped, "AVTransportURI", "val");
    let position = extract_attr(&unescaped, "RelativeTimePosition", "val");
    (state, uri, position)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn envelope_contains_action_and_fields_in_order() {
        let fields = vec![
            ("InstanceID".to_string(), "0".to_string()),
            ("Speed".to_string(), "1".to_string()),
        ];
        let envelope = build_envelope("Play", "urn:schemas-upnp-org:service:AVTransport:1", &fields);
        assert!(envelope.contains("<u:Play xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\">"));
        assert!(envelope.contains("<InstanceID>0</InstanceID><Speed>1</Speed>"));
        assert!(envelope.ends_with("</u:Play></s:Body></s:Envelope>"));
    }

    #[test]
    fn extract_tag_handles_namespace_prefix() {
        let xml = "<u:CurrentVolume val=\"x\">42</u:CurrentVolume>";
        assert_eq!(extract_tag(xml, "CurrentVolume").as_deref(), Some("42"));
    }

    #[test]
    fn extract_tag_handles_no_prefix() {
        let xml = "<RelTime>00:00:09</RelTime>";
        assert_eq!(extract_tag(xml, "RelTime").as_deref(), Some("00:00:09"));
    }

    #[test]
    fn extract_upnp_fault_reads_error_description() {
        let xml = "<Fault><detail><UPnPError><errorDescription>Invalid Action</errorDescription></UPnPError></detail></Fault>";
        assert_eq!(extract_upnp_fault(xml).as_deref(), Some("Invalid Action"));
    }

    #[test]
    fn parse_last_change_extracts_state_uri_and_position() {
        let body = "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\"><e:property><LastChange>\
             &lt;Event xmlns=\"urn:schemas-upnp-org:metadata-1-0/AVT/\"&gt;&lt;InstanceID val=\"0\"&gt;\
             &lt;TransportState val=\"PLAYING\"/&gt;&lt;AVTransportURI val=\"http://x/track.mp3\"/&gt;\
             &lt;RelativeTimePosition val=\"00:00:09\"/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;\
             </LastChange></e:property></e:propertyset>";
        let (state, uri, position) = parse_last_change(body);
        assert_eq!(state.as_deref(), Some("PLAYING"));
        assert_eq!(uri.as_deref(), Some("http://x/track.mp3"));
        assert_eq!(position.as_deref(), Some("00:00:09"));
    }

    #[test]
    fn parse_last_change_missing_tag_returns_all_none() {
        assert_eq!(parse_last_change("<e:propertyset/>"), (None, None, None));
    }
}

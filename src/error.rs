//! Error taxonomy for the bridge's component boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind SSDP socket: {0}")]
    Socket(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device at {location} is not a valid DLNA renderer: {reason}")]
    NotValid { location: String, reason: String },
    #[error("soap error: {0}")]
    Soap(#[from] SoapError),
    #[error("invalid location url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum SoapError {
    #[error("http status {0}")]
    Http(reqwest::StatusCode),
    #[error("connect error: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upnp fault: {0}")]
    UpnpFault(String),
    #[error("action {action} needs {needed} explicit argument(s), pass a map")]
    InvalidArgument { action: String, needed: usize },
    #[error("no such action {action} on {service_type}")]
    NoSuchAction { action: String, service_type: String },
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::DeError),
}

impl SoapError {
    /// True for the connect-refused class of error that drives per-device
    /// error-count escalation (spec's `ERROR_COUNT_TO_REMOVE`).
    pub fn is_connect_class(&self) -> bool {
        match self {
            SoapError::Connect(_) => true,
            SoapError::Request(e) => e.is_connect(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("refreshed queue is missing the previously selected item")]
    SelectionLost,
    #[error("offset {offset} out of range [0, {total})")]
    OutOfRange { offset: i64, total: i64 },
}

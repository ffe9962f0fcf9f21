//! UPnP/DLNA renderer client: root description, SCPD, SOAP dispatch, GENA.

pub mod device;
pub mod scpd;
pub mod soap;

pub use device::{ActionData, DlnaDevice, Service, UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE};

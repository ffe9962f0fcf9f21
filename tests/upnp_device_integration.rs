//! End-to-end coverage against a real (loopback) UPnP root device: fetch +
//! SCPD resolution (scenario S1) and connect-refused error escalation
//! (testable property 8 / scenario S5).

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use plex_dlna_bridge::upnp::{device, ActionData, UPNP_AVT_SERVICE_TYPE, UPNP_RC_SERVICE_TYPE};

const ROOT_DESC: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <friendlyName>Test Renderer</friendlyName>
    <UDN>uuid:test-renderer-uuid</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/AVTransport/control</controlURL>
        <eventSubURL>/AVTransport/event</eventSubURL>
        <SCPDURL>/AVTransport/scpd.xml</SCPDURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <controlURL>/RenderingControl/control</controlURL>
        <eventSubURL>/RenderingControl/event</eventSubURL>
        <SCPDURL>/RenderingControl/scpd.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#;

const AVT_SCPD: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action><name>Play</name>
      <argumentList>
        <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
        <argument><name>Speed</name><direction>in</direction><relatedStateVariable>TransportPlaySpeed</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable></serviceStateTable>
</scpd>"#;

const RC_SCPD: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action><name>GetVolume</name>
      <argumentList>
        <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
        <argument><name>Channel</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable></serviceStateTable>
</scpd>"#;

async fn xml(body: &'static str) -> impl IntoResponse {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(body.to_string())
        .unwrap()
}

async fn root_desc() -> impl IntoResponse {
    xml(ROOT_DESC).await
}
async fn avt_scpd() -> impl IntoResponse {
    xml(AVT_SCPD).await
}
async fn rc_scpd() -> impl IntoResponse {
    xml(RC_SCPD).await
}
async fn avt_control() -> impl IntoResponse {
    StatusCode::BAD_REQUEST
}

async fn start_mock_renderer() -> SocketAddr {
    let app = Router::new()
        .route("/desc.xml", get(root_desc))
        .route("/AVTransport/scpd.xml", get(avt_scpd))
        .route("/RenderingControl/scpd.xml", get(rc_scpd))
        .route("/AVTransport/control", post(avt_control))
        .with_state(());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// S1: a valid root description with AVT+RC services yields a device whose
/// uuid is extracted from the UDN and whose services are both resolvable.
#[tokio::test]
async fn fetch_resolves_device_and_both_services() {
    let addr = start_mock_renderer().await;
    let location = url::Url::parse(&format!("http://{addr}/desc.xml")).unwrap();
    let http = reqwest::Client::new();

    let device = device::fetch(location, &http, "Plex DLNA Bridge", |_uuid, name, _ip| name.to_string())
        .await
        .expect("fetch should succeed against a valid description");

    assert_eq!(device.uuid, "test-renderer-uuid");
    assert_eq!(device.name(), "Test Renderer");
    assert!(device.service(UPNP_AVT_SERVICE_TYPE).is_some());
    assert!(device.service(UPNP_RC_SERVICE_TYPE).is_some());
}

#[tokio::test]
async fn fetch_rejects_description_missing_rendering_control() {
    async fn root_desc_avt_only() -> impl IntoResponse {
        xml(r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <friendlyName>Partial Renderer</friendlyName>
    <UDN>uuid:partial-uuid</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/AVTransport/control</controlURL>
        <eventSubURL>/AVTransport/event</eventSubURL>
        <SCPDURL>/AVTransport/scpd.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#)
        .await
    }

    let app = Router::new()
        .route("/desc.xml", get(root_desc_avt_only))
        .route("/AVTransport/scpd.xml", get(avt_scpd));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let location = url::Url::parse(&format!("http://{addr}/desc.xml")).unwrap();
    let http = reqwest::Client::new();
    let result = device::fetch(location, &http, "Plex DLNA Bridge", |_uuid, name, _ip| name.to_string()).await;
    assert!(result.is_err(), "a device missing RenderingControl must be rejected");
}

/// Property 8 / S5: 20 consecutive connect-refused control calls trip the
/// removal threshold, and not one fewer.
#[tokio::test]
async fn error_threshold_trips_at_exactly_twenty_connect_failures() {
    // Reserve a port and release it immediately: nothing listens there, so
    // any connection attempt fails with connect-refused, mirroring the
    // original's `ClientConnectorError` escalation path.
    let dead_port = {
        let l = std::net::TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        l.local_addr().unwrap().port()
    };
    let dead_control_url = format!("http://127.0.0.1:{dead_port}/control");

    let root_desc = format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <friendlyName>Dead Renderer</friendlyName>
    <UDN>uuid:dead-renderer-uuid</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>{dead_control_url}</controlURL>
        <eventSubURL>/AVTransport/event</eventSubURL>
        <SCPDURL>/AVTransport/scpd.xml</SCPDURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <controlURL>/RenderingControl/control</controlURL>
        <eventSubURL>/RenderingControl/event</eventSubURL>
        <SCPDURL>/RenderingControl/scpd.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#
    );

    let app = Router::new()
        .route("/desc.xml", get(move || { let body = root_desc.clone(); async move { xml_string(body).await } }))
        .route("/AVTransport/scpd.xml", get(avt_scpd))
        .route("/RenderingControl/scpd.xml", get(rc_scpd));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let location = url::Url::parse(&format!("http://{addr}/desc.xml")).unwrap();
    let http = reqwest::Client::new();
    let device = device::fetch(location, &http, "Plex DLNA Bridge", |_uuid, name, _ip| name.to_string())
        .await
        .expect("fetch should succeed even though the control URL is dead; only control calls hit it");

    for i in 1..20 {
        let _ = device
            .service(UPNP_AVT_SERVICE_TYPE)
            .unwrap()
            .control(&http, "Play", ActionData::Scalar("1".to_string()), &device)
            .await;
        assert!(!device.error_threshold_reached(), "threshold must not trip before 20 consecutive failures (pass {i})");
    }
    let _ = device
        .service(UPNP_AVT_SERVICE_TYPE)
        .unwrap()
        .control(&http, "Play", ActionData::Scalar("1".to_string()), &device)
        .await;
    assert!(device.error_threshold_reached(), "threshold must trip on the 20th consecutive connect failure");
}

async fn xml_string(body: String) -> impl IntoResponse {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(body)
        .unwrap()
}

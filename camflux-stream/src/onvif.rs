//! ONVIF discovery: device information, media profiles and stream URI
//! resolution over SOAP, with WS-Security UsernameToken digest auth.
//!
//! The XML handling is deliberately namespace-agnostic: devices disagree
//! wildly about prefixes (`tds:`, `trt:`, `tt:` or none at all), so
//! elements are matched on their local name only. When any stage of
//! discovery fails, the capture falls back to a brand-default RTSP path
//! keyed by the reported manufacturer.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camflux_core::models::{redact_url_credentials, ConnectionConfig, Protocol, StreamDetails};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::capture::{FrameSource, ProtocolCapture};
use crate::error::{Error, Result};
use crate::rtsp::RtspCapture;

/// Ports probed after the configured one. 2020 is common on cheap PTZ
/// cameras, 8080 on devices that share the port with their web UI.
const FALLBACK_ONVIF_PORTS: &[u16] = &[2020, 8080];

const GET_DEVICE_INFORMATION: &str =
    r#"<GetDeviceInformation xmlns="http://www.onvif.org/ver10/device/wsdl"/>"#;

const GET_CAPABILITIES: &str = r#"<GetCapabilities xmlns="http://www.onvif.org/ver10/device/wsdl"><Category>Media</Category></GetCapabilities>"#;

const GET_PROFILES: &str = r#"<GetProfiles xmlns="http://www.onvif.org/ver10/media/wsdl"/>"#;

fn get_stream_uri_body(profile_token: &str) -> String {
    format!(
        r#"<GetStreamUri xmlns="http://www.onvif.org/ver10/media/wsdl"><StreamSetup><Stream xmlns="http://www.onvif.org/ver10/schema">RTP-Unicast</Stream><Transport xmlns="http://www.onvif.org/ver10/schema"><Protocol>RTSP</Protocol></Transport></StreamSetup><ProfileToken>{}</ProfileToken></GetStreamUri>"#,
        xml_escape(profile_token)
    )
}

// ---------------------------------------------------------------------------
// WS-Security
// ---------------------------------------------------------------------------

/// UsernameToken digest: Base64(SHA1(nonce + created + password)).
fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn security_header(username: &str, password: &str) -> String {
    let nonce: [u8; 16] = rand::random();
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let digest = password_digest(&nonce, &created, password);
    format!(
        concat!(
            r#"<s:Header><Security s:mustUnderstand="1" xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">"#,
            r#"<UsernameToken><Username>{username}</Username>"#,
            r#"<Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{digest}</Password>"#,
            r#"<Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{nonce}</Nonce>"#,
            r#"<Created xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{created}</Created>"#,
            r#"</UsernameToken></Security></s:Header>"#
        ),
        username = xml_escape(username),
        digest = digest,
        nonce = BASE64.encode(nonce),
        created = created,
    )
}

fn soap_envelope(security: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">{security}<s:Body>{body}</s:Body></s:Envelope>"#
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Namespace-agnostic XML extraction
// ---------------------------------------------------------------------------

struct XmlElement<'a> {
    open_tag: &'a str,
    inner: &'a str,
}

/// All elements whose local name matches, with whatever prefix.
fn elements<'a>(xml: &'a str, local: &str) -> Vec<XmlElement<'a>> {
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(off) = xml[i..].find('<') {
        let start = i + off;
        let rest = &xml[start + 1..];
        if rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('!') {
            i = start + 1;
            continue;
        }
        let name_end = match rest.find(|c: char| c == ' ' || c == '>' || c == '/') {
            Some(pos) => pos,
            None => break,
        };
        let name = &rest[..name_end];
        let local_name = name.rsplit(':').next().unwrap_or(name);
        if local_name != local {
            i = start + 1;
            continue;
        }
        let open_end = match rest.find('>') {
            Some(pos) => pos,
            None => break,
        };
        let open_tag = &xml[start..start + 1 + open_end + 1];
        if rest[..open_end].ends_with('/') {
            out.push(XmlElement { open_tag, inner: "" });
            i = start + 1 + open_end + 1;
            continue;
        }
        let content_start = start + 1 + open_end + 1;
        match find_closing(&xml[content_start..], local) {
            Some(close) => {
                out.push(XmlElement {
                    open_tag,
                    inner: &xml[content_start..content_start + close],
                });
                i = content_start + close + 2;
            }
            None => break,
        }
    }
    out
}

fn find_closing(xml: &str, local: &str) -> Option<usize> {
    let mut i = 0;
    while let Some(off) = xml[i..].find("</") {
        let start = i + off;
        let rest = &xml[start + 2..];
        let end = rest.find('>')?;
        let name = rest[..end].trim();
        let local_name = name.rsplit(':').next().unwrap_or(name);
        if local_name == local {
            return Some(start);
        }
        i = start + 2 + end;
    }
    None
}

fn first_element<'a>(xml: &'a str, local: &str) -> Option<XmlElement<'a>> {
    elements(xml, local).into_iter().next()
}

/// Trimmed text content of the first matching element.
fn extract_value(xml: &str, local: &str) -> Option<String> {
    first_element(xml, local)
        .map(|el| el.inner.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn attribute(open_tag: &str, name: &str) -> Option<String> {
    let pattern = format!("{name}=\"");
    let start = open_tag.find(&pattern)? + pattern.len();
    let end = open_tag[start..].find('"')?;
    Some(open_tag[start..start + end].to_string())
}

fn parse_fault(xml: &str) -> Option<String> {
    let fault = first_element(xml, "Fault")?;
    Some(
        extract_value(fault.inner, "Text")
            .or_else(|| extract_value(fault.inner, "Reason"))
            .unwrap_or_else(|| "unspecified SOAP fault".to_string()),
    )
}

// ---------------------------------------------------------------------------
// Profiles and URIs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct OnvifProfile {
    token: String,
    name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

fn parse_profiles(xml: &str) -> Vec<OnvifProfile> {
    elements(xml, "Profiles")
        .into_iter()
        .filter_map(|el| {
            let token = attribute(el.open_tag, "token")?;
            Some(OnvifProfile {
                token,
                name: extract_value(el.inner, "Name"),
                width: extract_value(el.inner, "Width").and_then(|v| v.parse().ok()),
                height: extract_value(el.inner, "Height").and_then(|v| v.parse().ok()),
            })
        })
        .collect()
}

/// Highest pixel count wins; cameras list the main stream alongside one or
/// more substreams and we want the best quality source for capture.
fn best_profile(profiles: &[OnvifProfile]) -> Option<&OnvifProfile> {
    profiles
        .iter()
        .max_by_key(|p| u64::from(p.width.unwrap_or(0)) * u64::from(p.height.unwrap_or(0)))
}

fn parse_stream_uri(xml: &str) -> Option<String> {
    extract_value(xml, "Uri")
}

fn is_usable_stream_uri(uri: &str) -> bool {
    uri.get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsp://"))
}

/// Injects credentials into a discovered URI unless it already carries
/// userinfo of its own.
fn with_credentials(uri: &str, username: &str, password: &str) -> String {
    if username.is_empty() {
        return uri.to_string();
    }
    match url::Url::parse(uri) {
        Ok(mut parsed) => {
            if !parsed.username().is_empty() {
                return uri.to_string();
            }
            if parsed.set_username(username).is_err() {
                return uri.to_string();
            }
            if !password.is_empty() && parsed.set_password(Some(password)).is_err() {
                return uri.to_string();
            }
            parsed.to_string()
        }
        Err(_) => uri.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Brand fallback paths
// ---------------------------------------------------------------------------

struct BrandPath {
    keywords: &'static [&'static str],
    path: &'static str,
}

const BRAND_RTSP_PATHS: &[BrandPath] = &[
    BrandPath {
        keywords: &["hikvision", "hik"],
        path: "Streaming/Channels/101",
    },
    BrandPath {
        keywords: &["dahua", "lorex", "amcrest"],
        path: "cam/realmonitor?channel=1&subtype=0",
    },
    BrandPath {
        keywords: &["axis"],
        path: "axis-media/media.amp",
    },
    BrandPath {
        keywords: &["uniview", "unv"],
        path: "unicast/c1/s0/live",
    },
    BrandPath {
        keywords: &["reolink"],
        path: "h264Preview_01_main",
    },
];

const GENERIC_RTSP_PATH: &str = "stream1";

fn brand_rtsp_path(manufacturer: Option<&str>) -> &'static str {
    let Some(manufacturer) = manufacturer else {
        return GENERIC_RTSP_PATH;
    };
    let lower = manufacturer.to_lowercase();
    for brand in BRAND_RTSP_PATHS {
        if brand.keywords.iter().any(|k| lower.contains(k)) {
            return brand.path;
        }
    }
    GENERIC_RTSP_PATH
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

pub struct OnvifCapture {
    camera_id: String,
    connection: ConnectionConfig,
    target_fps: u32,
    details: StreamDetails,
    inner: Option<RtspCapture>,
}

impl OnvifCapture {
    pub fn new(
        camera_id: impl Into<String>,
        connection: ConnectionConfig,
        target_fps: u32,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            connection,
            target_fps,
            details: StreamDetails::default(),
            inner: None,
        }
    }

    fn device_service_urls(&self) -> Vec<String> {
        let mut urls = vec![self.connection.onvif_device_service_url()];
        for port in FALLBACK_ONVIF_PORTS {
            if *port != self.connection.onvif_port {
                urls.push(format!(
                    "http://{}:{}/onvif/device_service",
                    self.connection.ip, port
                ));
            }
        }
        urls
    }

    async fn soap_request(
        &self,
        client: &reqwest::Client,
        url: &str,
        body: &str,
    ) -> Result<String> {
        let security = if self.connection.username.is_empty() {
            String::new()
        } else {
            security_header(&self.connection.username, &self.connection.password)
        };
        let envelope = soap_envelope(&security, body);
        let response = client
            .post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::Connection(format!("ONVIF request to {url} failed: {e}"))
                } else {
                    Error::Http(e)
                }
            })?;
        let status = response.status();
        let text = response.text().await?;
        if status.as_u16() == 401 || text.contains("NotAuthorized") {
            return Err(Error::Validation(
                "ONVIF authentication rejected".to_string(),
            ));
        }
        if let Some(fault) = parse_fault(&text) {
            return Err(Error::Validation(format!("ONVIF fault: {fault}")));
        }
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "ONVIF request to {url} failed with status {status}"
            )));
        }
        Ok(text)
    }

    /// Walks the candidate device-service ports. A transport failure moves
    /// on to the next port; a SOAP-level answer settles the endpoint.
    async fn discover_device(&mut self, client: &reqwest::Client) -> Option<String> {
        for url in self.device_service_urls() {
            match self.soap_request(client, &url, GET_DEVICE_INFORMATION).await {
                Ok(xml) => {
                    self.details.manufacturer = extract_value(&xml, "Manufacturer");
                    self.details.model = extract_value(&xml, "Model");
                    debug!(
                        camera_id = %self.camera_id,
                        url = %url,
                        manufacturer = self.details.manufacturer.as_deref().unwrap_or("unknown"),
                        "ONVIF device service answered"
                    );
                    return Some(url);
                }
                Err(Error::Connection(e)) => {
                    debug!(camera_id = %self.camera_id, url = %url, error = %e, "ONVIF port probe failed");
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, url = %url, error = %e, "ONVIF device query rejected");
                    return None;
                }
            }
        }
        None
    }

    async fn resolve_media_service(
        &self,
        client: &reqwest::Client,
        device_url: &str,
    ) -> String {
        let capabilities = self.soap_request(client, device_url, GET_CAPABILITIES).await;
        capabilities
            .ok()
            .and_then(|xml| {
                first_element(&xml, "Media").and_then(|media| extract_value(media.inner, "XAddr"))
            })
            .unwrap_or_else(|| device_url.to_string())
    }

    async fn discover_stream_uri(
        &mut self,
        client: &reqwest::Client,
        media_url: &str,
    ) -> Option<String> {
        let profiles_xml = match self.soap_request(client, media_url, GET_PROFILES).await {
            Ok(xml) => xml,
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, "ONVIF GetProfiles failed");
                return None;
            }
        };
        let profiles = parse_profiles(&profiles_xml);
        let profile = best_profile(&profiles)?;
        self.details.profile_name = profile.name.clone();
        if let (Some(w), Some(h)) = (profile.width, profile.height) {
            self.details.resolution = Some((w, h));
        }
        let body = get_stream_uri_body(&profile.token);
        match self.soap_request(client, media_url, &body).await {
            Ok(xml) => parse_stream_uri(&xml),
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, "ONVIF GetStreamUri failed");
                None
            }
        }
    }

    /// Full discovery pipeline ending in a connectable RTSP URL. Every
    /// failure path lands on the brand-default construction.
    async fn resolve_stream_url(&mut self) -> String {
        let client = match reqwest::Client::builder()
            .connect_timeout(self.connection.connect_timeout())
            .timeout(self.connection.connect_timeout() + self.connection.read_timeout())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, "HTTP client build failed, skipping ONVIF discovery");
                return self
                    .connection
                    .rtsp_url(brand_rtsp_path(None));
            }
        };

        let discovered = match self.discover_device(&client).await {
            Some(device_url) => {
                let media_url = self.resolve_media_service(&client, &device_url).await;
                self.discover_stream_uri(&client, &media_url).await
            }
            None => None,
        };

        match discovered.filter(|uri| is_usable_stream_uri(uri)) {
            Some(uri) => with_credentials(
                &uri,
                &self.connection.username,
                &self.connection.password,
            ),
            None => {
                let path = brand_rtsp_path(self.details.manufacturer.as_deref());
                info!(
                    camera_id = %self.camera_id,
                    path,
                    "ONVIF discovery yielded no stream URI, using brand RTSP path"
                );
                self.connection.rtsp_url(path)
            }
        }
    }
}

#[async_trait]
impl ProtocolCapture for OnvifCapture {
    fn protocol(&self) -> Protocol {
        Protocol::Onvif
    }

    async fn connect(&mut self) -> Result<()> {
        let url = self.resolve_stream_url().await;
        self.details.source_url = Some(redact_url_credentials(&url));
        let mut inner = RtspCapture::with_url(
            self.camera_id.clone(),
            url,
            &self.connection,
            self.target_fps,
        );
        inner.connect().await?;
        self.inner = Some(inner);
        Ok(())
    }

    async fn validate(&mut self) -> Result<StreamDetails> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::Validation("capture is not connected".to_string()))?;
        let measured = inner.validate().await?;
        // Measured facts beat what the profile claimed.
        self.details.merge(measured);
        Ok(self.details.clone())
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::Validation("capture is not connected".to_string()))?;
        inner.open_source()
    }

    async fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES_XML: &str = r#"<?xml version="1.0"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
 <SOAP-ENV:Body>
  <trt:GetProfilesResponse>
   <trt:Profiles token="prof_sub" fixed="true">
    <tt:Name>SubStream</tt:Name>
    <tt:VideoEncoderConfiguration token="venc_sub">
     <tt:Resolution><tt:Width>640</tt:Width><tt:Height>360</tt:Height></tt:Resolution>
    </tt:VideoEncoderConfiguration>
   </trt:Profiles>
   <trt:Profiles token="prof_main" fixed="true">
    <tt:Name>MainStream</tt:Name>
    <tt:VideoEncoderConfiguration token="venc_main">
     <tt:Resolution><tt:Width>1920</tt:Width><tt:Height>1080</tt:Height></tt:Resolution>
    </tt:VideoEncoderConfiguration>
   </trt:Profiles>
  </trt:GetProfilesResponse>
 </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#;

    #[test]
    fn digest_is_deterministic_and_sha1_sized() {
        let nonce = [7u8; 16];
        let a = password_digest(&nonce, "2024-01-01T00:00:00Z", "secret");
        let b = password_digest(&nonce, "2024-01-01T00:00:00Z", "secret");
        assert_eq!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 20);
        let c = password_digest(&[8u8; 16], "2024-01-01T00:00:00Z", "secret");
        assert_ne!(a, c);
    }

    #[test]
    fn security_header_names_the_user() {
        let header = security_header("admin", "secret");
        assert!(header.contains("<Username>admin</Username>"));
        assert!(header.contains("PasswordDigest"));
        assert!(header.contains("<Nonce"));
        assert!(!header.contains("secret"));
    }

    #[test]
    fn parses_profiles_and_picks_largest() {
        let profiles = parse_profiles(PROFILES_XML);
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].token, "prof_sub");
        assert_eq!(profiles[0].name.as_deref(), Some("SubStream"));
        assert_eq!(profiles[0].width, Some(640));
        let best = best_profile(&profiles).unwrap();
        assert_eq!(best.token, "prof_main");
        assert_eq!(best.height, Some(1080));
    }

    #[test]
    fn parses_stream_uri_response() {
        let xml = r#"<e:Envelope xmlns:e="x"><e:Body><trt:GetStreamUriResponse xmlns:trt="y"><trt:MediaUri><tt:Uri xmlns:tt="z">rtsp://192.168.1.7:554/main</tt:Uri></trt:MediaUri></trt:GetStreamUriResponse></e:Body></e:Envelope>"#;
        assert_eq!(
            parse_stream_uri(xml).as_deref(),
            Some("rtsp://192.168.1.7:554/main")
        );
    }

    #[test]
    fn detects_soap_fault() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body><s:Fault><s:Reason><s:Text xml:lang="en">Sender not authorized</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        assert_eq!(parse_fault(xml).as_deref(), Some("Sender not authorized"));
        assert!(parse_fault("<a><b>ok</b></a>").is_none());
    }

    #[test]
    fn credentials_injected_only_when_absent() {
        assert_eq!(
            with_credentials("rtsp://192.168.1.7/main", "admin", "pw"),
            "rtsp://admin:pw@192.168.1.7/main"
        );
        assert_eq!(
            with_credentials("rtsp://other:x@192.168.1.7/main", "admin", "pw"),
            "rtsp://other:x@192.168.1.7/main"
        );
        assert_eq!(
            with_credentials("rtsp://192.168.1.7/main", "", "pw"),
            "rtsp://192.168.1.7/main"
        );
    }

    #[test]
    fn credentials_with_specials_are_encoded() {
        let url = with_credentials("rtsp://192.168.1.7/main", "admin", "p@ss/w");
        assert!(url.starts_with("rtsp://admin:"));
        assert!(!url.contains("p@ss/w"));
        assert!(url.ends_with("@192.168.1.7/main"));
    }

    #[test]
    fn brand_paths_cover_known_vendors() {
        assert_eq!(
            brand_rtsp_path(Some("HIKVISION")),
            "Streaming/Channels/101"
        );
        assert_eq!(
            brand_rtsp_path(Some("Dahua Technology Co.")),
            "cam/realmonitor?channel=1&subtype=0"
        );
        assert_eq!(brand_rtsp_path(Some("AXIS Communications")), "axis-media/media.amp");
        assert_eq!(brand_rtsp_path(Some("Obscure Vendor")), GENERIC_RTSP_PATH);
        assert_eq!(brand_rtsp_path(None), GENERIC_RTSP_PATH);
    }

    #[test]
    fn usable_uri_requires_rtsp_scheme() {
        assert!(is_usable_stream_uri("rtsp://host/path"));
        assert!(is_usable_stream_uri("RTSP://host/path"));
        assert!(!is_usable_stream_uri("http://host/path"));
        assert!(!is_usable_stream_uri("rtsp:"));
    }

    #[test]
    fn attribute_extraction_reads_token() {
        let el = first_element(PROFILES_XML, "Profiles").unwrap();
        assert_eq!(attribute(el.open_tag, "token").as_deref(), Some("prof_sub"));
        assert_eq!(attribute(el.open_tag, "missing"), None);
    }

    #[test]
    fn device_service_urls_walk_fallback_ports() {
        let connection = ConnectionConfig {
            ip: "10.0.0.5".to_string(),
            onvif_port: 80,
            ..ConnectionConfig::default()
        };
        let capture = OnvifCapture::new("cam-b", connection, 10);
        let urls = capture.device_service_urls();
        assert_eq!(
            urls,
            vec![
                "http://10.0.0.5:80/onvif/device_service",
                "http://10.0.0.5:2020/onvif/device_service",
                "http://10.0.0.5:8080/onvif/device_service",
            ]
        );
    }

    #[test]
    fn duplicate_fallback_port_not_probed_twice() {
        let connection = ConnectionConfig {
            ip: "10.0.0.5".to_string(),
            onvif_port: 2020,
            ..ConnectionConfig::default()
        };
        let capture = OnvifCapture::new("cam-b", connection, 10);
        assert_eq!(capture.device_service_urls().len(), 2);
    }
}

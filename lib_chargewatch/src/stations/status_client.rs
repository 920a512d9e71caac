//! # Vendor Status Client
//!
//! Fetches per-port occupancy for a station from the vendor's device-detail
//! endpoint. [`StatusSource::fetch_status`] never fails: timeouts, transport
//! errors, business failures and malformed payloads all degrade to a
//! synthetic snapshot whose [`SnapshotOrigin`] records what went wrong.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::configs::config_sync::{SyntheticConfig, VendorConfig, DEFAULT_SERVICE_LABEL};
use crate::errors::{SyncError, SyncResult};
use crate::retrieve::ky_http::{ApiClient, HttpPolicy};
use crate::signing::RequestSigner;
use crate::stations::model::{
    now_unix_ms, FailureClass, FetchFailure, PortReading, PortStatus, SnapshotOrigin, StatusSnapshot,
};
use crate::stations::synthetic::SyntheticGenerator;

/// Anything that can produce a snapshot for a station.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Always returns a snapshot, genuine or synthetic.
    async fn fetch_status(&self, station_id: &str) -> StatusSnapshot;
}

/// Counters of snapshot provenance.
#[derive(Debug, Default)]
pub struct ClientStats {
    live: AtomicU64,
    forced_synthetic: AtomicU64,
    fallback_transient: AtomicU64,
    fallback_business: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStatsSnapshot {
    pub live: u64,
    pub forced_synthetic: u64,
    pub fallback_transient: u64,
    pub fallback_business: u64,
}

impl ClientStats {
    fn record(&self, origin: &SnapshotOrigin) {
        let counter = match origin {
            SnapshotOrigin::Vendor => &self.live,
            SnapshotOrigin::ForcedSynthetic => &self.forced_synthetic,
            SnapshotOrigin::Fallback(f) => match f.class {
                FailureClass::TransientNetwork => &self.fallback_transient,
                FailureClass::VendorBusiness => &self.fallback_business,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            live: self.live.load(Ordering::Relaxed),
            forced_synthetic: self.forced_synthetic.load(Ordering::Relaxed),
            fallback_transient: self.fallback_transient.load(Ordering::Relaxed),
            fallback_business: self.fallback_business.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VendorEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<VendorDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorDevice {
    #[serde(default)]
    port_list: Vec<VendorPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorPort {
    #[serde(default)]
    port_id: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
}

/// Client for the vendor device-detail endpoint.
pub struct StationClient {
    http: ApiClient,
    signer: Option<RequestSigner>,
    app_id: String,
    app_comm_id: String,
    token: Option<String>,
    force_synthetic: bool,
    synthetic: SyntheticGenerator,
    stats: Arc<ClientStats>,
}

impl StationClient {
    pub fn new(vendor: &VendorConfig, synthetic: SyntheticConfig) -> SyncResult<Self> {
        let http = ApiClient::new(&vendor.endpoint, &HttpPolicy::from(vendor))?;
        Ok(Self {
            http,
            signer: vendor.secret_key.as_deref().map(RequestSigner::new),
            app_id: vendor.app_id.clone(),
            app_comm_id: vendor.app_comm_id.clone(),
            token: vendor.token.clone(),
            force_synthetic: vendor.force_synthetic,
            synthetic: SyntheticGenerator::new(synthetic),
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    /// One signed request without fallback. Errors carry their failure class.
    pub async fn fetch_live(&self, station_id: &str) -> SyncResult<StatusSnapshot> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SyncError::Config("vendor secret key is not configured".into()))?;
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SyncError::Config("vendor token is not configured".into()))?;

        let timestamp = now_unix_ms().to_string();
        let mut params = Map::new();
        params.insert("pno".to_string(), Value::String(station_id.to_string()));
        let signature = signer.sign(&params, &Method::GET, &timestamp)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(HeaderName::from_static("client"), HeaderValue::from_static("wechat"));
        headers.insert(HeaderName::from_static("forcecheck"), HeaderValue::from_static("1"));
        headers.insert(HeaderName::from_static("appversion"), HeaderValue::from_static("1.3"));
        headers.insert(HeaderName::from_static("timestamp"), header_value("timestamp", &timestamp)?);
        headers.insert(HeaderName::from_static("signature"), header_value("signature", &signature)?);
        headers.insert(HeaderName::from_static("appid"), header_value("appid", &self.app_id)?);
        headers.insert(HeaderName::from_static("appcommid"), header_value("appcommid", &self.app_comm_id)?);
        headers.insert(HeaderName::from_static("token"), header_value("token", token)?);

        let envelope: VendorEnvelope = self
            .http
            .request::<VendorEnvelope, ()>(Method::GET, "", &[("pno", station_id)], Some(headers), None)
            .await?
            .into_result()?;

        let fetched_at_ms = now_unix_ms();
        let ports = parse_ports(envelope, fetched_at_ms)?;
        Ok(StatusSnapshot {
            station_id: station_id.to_string(),
            ports,
            origin: SnapshotOrigin::Vendor,
            fetched_at_ms,
        })
    }

    fn degrade(&self, station_id: &str, error: &SyncError) -> StatusSnapshot {
        let failure = FetchFailure::from_error(error);
        tracing::warn!(
            station_id,
            class = failure.class.as_str(),
            reason = %failure.reason,
            "vendor fetch failed, serving synthetic snapshot"
        );
        self.synthetic
            .generate(station_id, SnapshotOrigin::Fallback(failure), now_unix_ms())
    }
}

#[async_trait]
impl StatusSource for StationClient {
    async fn fetch_status(&self, station_id: &str) -> StatusSnapshot {
        let snapshot = if station_id.is_empty() {
            let failure = FetchFailure {
                class: FailureClass::VendorBusiness,
                reason: "empty station id".to_string(),
            };
            tracing::warn!("fetch requested for empty station id");
            StatusSnapshot {
                station_id: String::new(),
                ports: Vec::new(),
                origin: SnapshotOrigin::Fallback(failure),
                fetched_at_ms: now_unix_ms(),
            }
        } else if self.force_synthetic {
            tracing::debug!(station_id, "forced synthetic mode");
            self.synthetic
                .generate(station_id, SnapshotOrigin::ForcedSynthetic, now_unix_ms())
        } else {
            match self.fetch_live(station_id).await {
                Ok(snapshot) => {
                    tracing::debug!(station_id, ports = snapshot.ports.len(), "vendor snapshot fetched");
                    snapshot
                }
                Err(error) => self.degrade(station_id, &error),
            }
        };
        self.stats.record(&snapshot.origin);
        snapshot
    }
}

fn header_value(name: &str, value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SyncError::Config(format!("{name} is not a valid header value")))
}

fn parse_ports(envelope: VendorEnvelope, observed_at_ms: i64) -> SyncResult<Vec<PortReading>> {
    if envelope.success == Some(false) {
        return Err(SyncError::VendorBusiness(format!(
            "vendor reported failure (code {}, msg {})",
            envelope.code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
            envelope.msg.unwrap_or_default()
        )));
    }
    let device = envelope
        .data
        .ok_or_else(|| SyncError::VendorBusiness("response has no device data".into()))?;

    device
        .port_list
        .into_iter()
        .map(|port| {
            let port_number = port
                .port_id
                .as_ref()
                .and_then(port_number)
                .ok_or_else(|| SyncError::VendorBusiness(format!("bad portId: {:?}", port.port_id)))?;
            let status = PortStatus::from_vendor_code(status_code(port.status.as_ref()));
            Ok(PortReading::from_occupancy(port_number, status, DEFAULT_SERVICE_LABEL, observed_at_ms))
        })
        .collect()
}

fn port_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Anything that is not recognizably zero counts as occupied.
fn status_code(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(-1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(-1),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http_ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    /// Answers every request with `response` and records the raw request heads.
    async fn mock_vendor(response: String) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock vendor");
        let url = format!("http://{}/device/detail", listener.local_addr().expect("addr"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                log.lock().unwrap().push(String::from_utf8_lossy(&buf[..n]).into_owned());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.flush().await;
            }
        });
        (url, seen)
    }

    /// Accepts connections and never answers.
    async fn stalled_vendor() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stalled vendor");
        let url = format!("http://{}/device/detail", listener.local_addr().expect("addr"));
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        url
    }

    fn vendor_config(endpoint: &str) -> VendorConfig {
        VendorConfig {
            endpoint: endpoint.to_string(),
            secret_key: Some("secret".into()),
            token: Some("AppletUser:test".into()),
            connect_timeout_ms: 300,
            read_timeout_ms: 300,
            max_http_retries: 0,
            retry_min_backoff_ms: 1,
            retry_max_backoff_ms: 2,
            ..VendorConfig::default()
        }
    }

    #[tokio::test]
    async fn live_payload_maps_to_vendor_snapshot() {
        let body = r#"{"success":true,"data":{"portList":[{"portId":1,"status":10},{"portId":2,"status":0}]}}"#;
        let (url, seen) = mock_vendor(http_ok(body)).await;
        let client = StationClient::new(&vendor_config(&url), SyntheticConfig::default()).unwrap();

        let snapshot = client.fetch_status("9313600954").await;

        assert_eq!(snapshot.origin, SnapshotOrigin::Vendor);
        assert_eq!(snapshot.ports.len(), 2);
        assert_eq!(snapshot.ports[0].status, PortStatus::Occupied);
        assert_eq!((snapshot.ports[0].voltage, snapshot.ports[0].current), (220.0, 10.0));
        assert_eq!(snapshot.ports[1].status, PortStatus::Free);
        assert_eq!(snapshot.ports[1].service, "充电服务");
        assert_eq!(client.stats().live, 1);

        // The request carries the query and the authentication headers.
        let requests = seen.lock().unwrap();
        let head = requests[0].to_ascii_lowercase();
        assert!(head.starts_with("get /device/detail?pno=9313600954 "));
        for header in ["timestamp:", "signature:", "appid: mengma", "appcommid:", "token: appletuser:test", "client: wechat"] {
            assert!(head.contains(header), "missing {header} in {head}");
        }
    }

    #[tokio::test]
    async fn timeout_degrades_to_profile_sized_synthetic_snapshot() {
        let url = stalled_vendor().await;
        let client = StationClient::new(&vendor_config(&url), SyntheticConfig::default()).unwrap();

        let snapshot = client.fetch_status("9313600954").await;

        assert_eq!(snapshot.ports.len(), 4);
        let failure = snapshot.origin.failure().expect("fallback origin");
        assert_eq!(failure.class, FailureClass::TransientNetwork);
        assert_eq!(client.stats().fallback_transient, 1);
    }

    #[tokio::test]
    async fn business_failure_degrades_to_synthetic() {
        let (url, _) = mock_vendor(http_ok(r#"{"success":false,"code":4001,"msg":"sign error"}"#)).await;
        let client = StationClient::new(&vendor_config(&url), SyntheticConfig::default()).unwrap();

        let snapshot = client.fetch_status("9313600954").await;

        assert_eq!(snapshot.ports.len(), 4);
        assert_eq!(snapshot.origin.failure().unwrap().class, FailureClass::VendorBusiness);
        assert!(snapshot.origin.failure().unwrap().reason.contains("sign error"));
    }

    #[tokio::test]
    async fn malformed_json_degrades_to_default_port_count() {
        let (url, _) = mock_vendor(http_ok("<html>maintenance</html>")).await;
        let mut synthetic = SyntheticConfig::default();
        synthetic.default_port_count = 6;
        let client = StationClient::new(&vendor_config(&url), synthetic).unwrap();

        let snapshot = client.fetch_status("5500000001").await;

        assert_eq!(snapshot.ports.len(), 6);
        assert_eq!(snapshot.origin.failure().unwrap().class, FailureClass::VendorBusiness);
        assert_eq!(client.stats().fallback_business, 1);
    }

    #[tokio::test]
    async fn forced_synthetic_never_touches_the_network() {
        let mut config = vendor_config("http://127.0.0.1:9/device/detail");
        config.force_synthetic = true;
        let client = StationClient::new(&config, SyntheticConfig::default()).unwrap();

        let snapshot = client.fetch_status("9313600954").await;

        assert_eq!(snapshot.origin, SnapshotOrigin::ForcedSynthetic);
        assert_eq!(snapshot.ports.len(), 4);
        assert_eq!(client.stats().forced_synthetic, 1);
    }

    #[test]
    fn missing_data_is_a_business_failure() {
        let envelope: VendorEnvelope = serde_json::from_str(r#"{"success":true,"data":null}"#).unwrap();
        assert!(matches!(parse_ports(envelope, 0), Err(SyncError::VendorBusiness(_))));
    }

    #[test]
    fn string_port_ids_and_missing_status_are_tolerated() {
        let envelope: VendorEnvelope =
            serde_json::from_str(r#"{"data":{"portList":[{"portId":"3","status":0},{"portId":4}]}}"#).unwrap();
        let ports = parse_ports(envelope, 0).unwrap();
        assert_eq!(ports[0].port_number, 3);
        assert_eq!(ports[0].status, PortStatus::Free);
        assert_eq!(ports[1].status, PortStatus::Occupied);
    }
}

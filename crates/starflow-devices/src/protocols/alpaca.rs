/*!
 * Alpaca REST client.
 *
 * Status is read with `GET /api/v1/{type}/{number}/{method}` and commands
 * are sent with a form-encoded `PUT` to the same path. Every request
 * carries `ClientID` and a monotonically increasing `ClientTransactionID`.
 * A reply is a JSON object whose `ErrorNumber` must be zero for the call to
 * count as a success, even when the HTTP status is 200.
 */
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Response};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, trace};
use url::Url;

use starflow_core::types::Value;
use starflow_core::utils::with_timeout;

use crate::device::{DeviceType, RemoteDeviceEndpoint};
use crate::error::{DeviceError, Result};
use crate::protocol::{CommandReply, CommandRequest, StatusFetcher, StatusRequest, Transport};

/// Keys of the reply envelope that are not device properties
const ENVELOPE_KEYS: &[&str] = &[
    "ErrorNumber",
    "ErrorMessage",
    "ClientTransactionID",
    "ServerTransactionID",
];

/// HTTP client bound to one Alpaca device
#[derive(Debug, Clone)]
pub struct AlpacaClient {
    http: Client,
    base: Url,
    client_id: u32,
    transaction_id: Arc<AtomicU32>,
}

impl AlpacaClient {
    /// Create a client for `endpoint` with a per-request timeout
    pub fn new(endpoint: &RemoteDeviceEndpoint, client_id: u32, timeout: Duration) -> Result<Self> {
        let http = build_http(Client::builder().timeout(timeout))?;
        Self::from_reqwest(
            &format!("http://{}", endpoint.authority()),
            endpoint.device_type,
            endpoint.device_number,
            client_id,
            http,
        )
    }

    /// Create a client from a server base URL and an existing `reqwest::Client`
    pub fn from_reqwest(
        server: &str,
        device_type: DeviceType,
        device_number: u32,
        client_id: u32,
        http: Client,
    ) -> Result<Self> {
        let base = Url::parse(server)
            .and_then(|url| url.join(&format!("api/v1/{}/{}/", device_type, device_number)))
            .map_err(|e| DeviceError::configuration(format!("Invalid server URL {}: {}", server, e)))?;
        Ok(Self {
            http,
            base,
            client_id,
            transaction_id: Arc::new(AtomicU32::new(0)),
        })
    }

    /// A client for commands to the same device, sharing the transaction counter
    ///
    /// Only establishing the connection is bounded. How long a command may
    /// run is up to the caller; a slew outlasts any status read.
    pub fn for_commands(&self, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http(Client::builder().connect_timeout(connect_timeout))?,
            base: self.base.clone(),
            client_id: self.client_id,
            transaction_id: self.transaction_id.clone(),
        })
    }

    /// Base URL of the device, ending in `/`
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn next_transaction_id(&self) -> u32 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn method_url(&self, method: &str) -> Result<Url> {
        self.base
            .join(&method.to_ascii_lowercase())
            .map_err(|e| DeviceError::configuration(format!("Invalid method {}: {}", method, e)))
    }

    /// `GET` a method and return the checked reply envelope
    pub async fn get(&self, method: &str) -> Result<Map<String, JsonValue>> {
        let mut url = self.method_url(method)?;
        let transaction = self.next_transaction_id();
        url.query_pairs_mut()
            .append_pair("ClientID", &self.client_id.to_string())
            .append_pair("ClientTransactionID", &transaction.to_string());

        trace!(%url, "GET");
        let response = self.http.get(url).send().await.map_err(map_send_error)?;
        decode(response).await
    }

    /// `PUT` a method with form parameters and return the checked reply envelope
    pub async fn put(&self, method: &str, parameters: &[(String, String)]) -> Result<Map<String, JsonValue>> {
        let url = self.method_url(method)?;
        let transaction = self.next_transaction_id();
        let mut form: Vec<(String, String)> = parameters.to_vec();
        form.push(("ClientID".to_string(), self.client_id.to_string()));
        form.push(("ClientTransactionID".to_string(), transaction.to_string()));

        debug!(%url, parameters = parameters.len(), "PUT");
        let response = self
            .http
            .put(url)
            .form(&form)
            .send()
            .await
            .map_err(map_send_error)?;
        decode(response).await
    }
}

fn build_http(builder: ClientBuilder) -> Result<Client> {
    builder
        .build()
        .map_err(|e| DeviceError::configuration(format!("Failed to build HTTP client: {}", e)))
}

fn map_send_error(err: reqwest::Error) -> DeviceError {
    if err.is_timeout() {
        DeviceError::timeout(err.to_string())
    } else {
        DeviceError::transport(err.to_string())
    }
}

async fn decode(response: Response) -> Result<Map<String, JsonValue>> {
    let status = response.status();
    if !status.is_success() {
        return Err(DeviceError::transport(format!("HTTP {}", status)));
    }

    let document: JsonValue = response.json().await.map_err(|e| {
        if e.is_timeout() {
            DeviceError::timeout(e.to_string())
        } else {
            DeviceError::protocol(format!("unparseable reply: {}", e))
        }
    })?;
    check_envelope(document)
}

/// Reject non-objects and nonzero `ErrorNumber` replies
pub fn check_envelope(document: JsonValue) -> Result<Map<String, JsonValue>> {
    let JsonValue::Object(map) = document else {
        return Err(DeviceError::protocol("reply is not a JSON object"));
    };

    let code = match map.get("ErrorNumber") {
        None | Some(JsonValue::Null) => 0,
        Some(number) => number
            .as_i64()
            .ok_or_else(|| DeviceError::protocol("ErrorNumber is not an integer"))?,
    };
    if code != 0 {
        let code = i32::try_from(code)
            .map_err(|_| DeviceError::protocol(format!("ErrorNumber {} is out of range", code)))?;
        let message = map
            .get("ErrorMessage")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        return Err(DeviceError::device(code, message));
    }
    Ok(map)
}

/// Flatten a checked envelope into `(name, value)` pairs for `request`
pub fn flatten(request: &StatusRequest, mut envelope: Map<String, JsonValue>) -> Result<Vec<(String, Value)>> {
    match request {
        StatusRequest::Property(name) => {
            let value = envelope
                .remove("Value")
                .ok_or_else(|| DeviceError::protocol(format!("reply to {} has no Value", name)))?;
            Ok(vec![(name.to_ascii_lowercase(), Value::from(value))])
        }
        StatusRequest::DeviceState => {
            let Some(JsonValue::Array(items)) = envelope.remove("Value") else {
                return Err(DeviceError::protocol("devicestate Value is not an array"));
            };
            items
                .into_iter()
                .map(|item| {
                    let JsonValue::Object(mut entry) = item else {
                        return Err(DeviceError::protocol("devicestate entry is not an object"));
                    };
                    let name = match entry.remove("Name") {
                        Some(JsonValue::String(name)) => name.to_ascii_lowercase(),
                        _ => return Err(DeviceError::protocol("devicestate entry has no Name")),
                    };
                    let value = entry.remove("Value").unwrap_or(JsonValue::Null);
                    Ok((name, Value::from(value)))
                })
                .collect()
        }
        StatusRequest::ReadAll => {
            if let Some(JsonValue::Object(values)) = envelope.remove("Value") {
                return Ok(values
                    .into_iter()
                    .map(|(name, value)| (name.to_ascii_lowercase(), Value::from(value)))
                    .collect());
            }
            Ok(envelope
                .into_iter()
                .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str()))
                .map(|(name, value)| (name.to_ascii_lowercase(), Value::from(value)))
                .collect())
        }
    }
}

#[async_trait]
impl StatusFetcher for AlpacaClient {
    async fn fetch(&self, request: &StatusRequest) -> Result<Vec<(String, Value)>> {
        let envelope = self.get(request.path_segment()).await?;
        flatten(request, envelope)
    }

    async fn supported_actions(&self) -> Result<Vec<String>> {
        let mut envelope = self.get("supportedactions").await?;
        match envelope.remove("Value") {
            Some(JsonValue::Array(items)) => Ok(items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()),
            _ => Err(DeviceError::protocol("supportedactions Value is not an array")),
        }
    }
}

/// Command transport over Alpaca `PUT`
///
/// Connecting sets the device's `connected` property to true.
#[derive(Debug)]
pub struct AlpacaTransport {
    client: AlpacaClient,
    connected: bool,
    link_timeout: Option<Duration>,
}

impl AlpacaTransport {
    /// Wrap a client
    pub fn new(client: AlpacaClient) -> Self {
        Self {
            client,
            connected: false,
            link_timeout: None,
        }
    }

    /// Bound connecting and disconnecting by `timeout`; commands are not affected
    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = Some(timeout);
        self
    }

    async fn set_connected(&self, connected: bool) -> Result<()> {
        let parameters = [("Connected".to_string(), connected.to_string())];
        let put = self.client.put("connected", &parameters);
        match self.link_timeout {
            Some(limit) => with_timeout(limit, put).await.map(|_| ()),
            None => put.await.map(|_| ()),
        }
    }
}

#[async_trait]
impl Transport for AlpacaTransport {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_connected(true).await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let result = self.set_connected(false).await;
        self.connected = false;
        result
    }

    async fn exchange(&mut self, request: &CommandRequest) -> Result<CommandReply> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        match self.client.put(&request.name, &request.parameters).await {
            Ok(mut envelope) => Ok(CommandReply {
                value: envelope.remove("Value").map(Value::from).unwrap_or(Value::Null),
            }),
            Err(e) => {
                if e.is_link_failure() {
                    self.connected = false;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(doc: JsonValue) -> Map<String, JsonValue> {
        check_envelope(doc).unwrap()
    }

    #[test]
    fn test_nonzero_error_number_is_a_device_error() {
        let err = check_envelope(json!({
            "Value": 0,
            "ErrorNumber": 1031,
            "ErrorMessage": "Not connected"
        }))
        .unwrap_err();
        assert_eq!(err, DeviceError::device(0x407, "Not connected"));
    }

    #[test]
    fn test_error_number_beyond_i32_is_protocol_error() {
        let err = check_envelope(json!({
            "ErrorNumber": 5_000_000_000_i64,
            "ErrorMessage": "Not connected"
        }))
        .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
        assert_eq!(err.code(), None);

        let err = check_envelope(json!({"ErrorNumber": -2_147_483_649_i64})).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_non_object_reply_is_protocol_error() {
        assert!(matches!(check_envelope(json!([1, 2])), Err(DeviceError::Protocol(_))));
        assert!(matches!(
            check_envelope(json!({"ErrorNumber": "zero"})),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn test_flatten_device_state() {
        let env = envelope(json!({
            "Value": [
                {"Name": "Position", "Value": 1200},
                {"Name": "IsMoving", "Value": false}
            ],
            "ErrorNumber": 0,
            "ErrorMessage": ""
        }));
        let pairs = flatten(&StatusRequest::DeviceState, env).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("position".to_string(), Value::Integer(1200)),
                ("ismoving".to_string(), Value::Bool(false)),
            ]
        );
    }

    #[test]
    fn test_flatten_device_state_rejects_scalar() {
        let env = envelope(json!({"Value": 3, "ErrorNumber": 0}));
        assert!(flatten(&StatusRequest::DeviceState, env).is_err());
    }

    #[test]
    fn test_flatten_read_all_top_level_pairs() {
        let env = envelope(json!({
            "Azimuth": 181.5,
            "Slewing": false,
            "ClientTransactionID": 4,
            "ServerTransactionID": 99,
            "ErrorNumber": 0,
            "ErrorMessage": ""
        }));
        let mut pairs = flatten(&StatusRequest::ReadAll, env).unwrap();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            pairs,
            vec![
                ("azimuth".to_string(), Value::Float(181.5)),
                ("slewing".to_string(), Value::Bool(false)),
            ]
        );
    }

    #[test]
    fn test_flatten_property_requires_value() {
        let env = envelope(json!({"ErrorNumber": 0}));
        assert!(matches!(
            flatten(&StatusRequest::property("position"), env),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn test_base_url_layout() {
        let client = AlpacaClient::from_reqwest(
            "http://10.0.0.7:6800",
            DeviceType::Dome,
            0,
            1,
            Client::new(),
        )
        .unwrap();
        assert_eq!(client.base_url().as_str(), "http://10.0.0.7:6800/api/v1/dome/0/");
        assert_eq!(
            client.method_url("ShutterStatus").unwrap().as_str(),
            "http://10.0.0.7:6800/api/v1/dome/0/shutterstatus"
        );
    }

    #[test]
    fn test_transaction_ids_increase() {
        let client = AlpacaClient::from_reqwest("http://h:1", DeviceType::Focuser, 0, 1, Client::new()).unwrap();
        let shared = client.clone();
        assert_eq!(client.next_transaction_id(), 1);
        assert_eq!(shared.next_transaction_id(), 2);
    }

    #[test]
    fn test_command_client_shares_transaction_ids() {
        let status = AlpacaClient::from_reqwest("http://h:1", DeviceType::Dome, 0, 1, Client::new()).unwrap();
        let commands = status.for_commands(Duration::from_secs(1)).unwrap();
        assert_eq!(commands.base_url(), status.base_url());
        assert_eq!(status.next_transaction_id(), 1);
        assert_eq!(commands.next_transaction_id(), 2);
    }
}

// Endpoint data model
//
// Descriptors identify one exported capability at one network location.
// Messages are what receivers see; `WireMessage` is the full HTTP envelope.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use url::Url;

use crate::transport::TransportError;

/// Protocol name under which the HTTP admin publishes its endpoints
pub const HTTP_PROTOCOL: &str = "org.inaetics.wiring.admin.http";

/// Identity of an endpoint: the (zone, node, service id, protocol) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    pub zone: String,
    pub node: String,
    pub service_id: String,
    pub protocol: String,
}

impl EndpointId {
    pub fn new(
        zone: impl Into<String>,
        node: impl Into<String>,
        service_id: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            zone: zone.into(),
            node: node.into(),
            service_id: service_id.into(),
            protocol: protocol.into(),
        }
    }

    /// Whether this endpoint lives on the given zone/node
    pub fn is_on(&self, zone: &str, node: &str) -> bool {
        self.zone == zone && self.node == node
    }

    /// Match against a directory path prefix of up to four segments
    pub fn matches_prefix(&self, segments: &[&str]) -> bool {
        let own = [
            self.zone.as_str(),
            self.node.as_str(),
            self.service_id.as_str(),
            self.protocol.as_str(),
        ];
        segments.len() <= own.len() && segments.iter().zip(own.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.zone, self.node, self.service_id, self.protocol
        )
    }
}

/// A complete, reachable endpoint.
///
/// Equality and hashing only consider the [`EndpointId`]; two descriptors that
/// differ only by url describe the same endpoint at two points in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    id: EndpointId,
    url: Url,
}

impl NodeDescriptor {
    pub fn new(id: EndpointId, url: Url) -> Self {
        Self { id, url }
    }

    /// Descriptor for an endpoint exported over HTTP at `base_url + service_id`
    pub fn http(
        zone: &str,
        node: &str,
        service_id: &str,
        base_url: &Url,
    ) -> Result<Self, url::ParseError> {
        let url = base_url.join(service_id)?;
        Ok(Self::new(
            EndpointId::new(zone, node, service_id, HTTP_PROTOCOL),
            url,
        ))
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn zone(&self) -> &str {
        &self.id.zone
    }

    pub fn node(&self) -> &str {
        &self.id.node
    }

    pub fn service_id(&self) -> &str {
        &self.id.service_id
    }

    pub fn protocol(&self) -> &str {
        &self.id.protocol
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Same identity, and also the same url
    pub fn same_location(&self, other: &NodeDescriptor) -> bool {
        self.id == other.id && self.url == other.url
    }
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeDescriptor {}

impl Hash for NodeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.id, self.url)
    }
}

/// A message as seen by a receiver or handed to a sender.
///
/// On delivery the `from_*` fields name the sending side and `service_id` the
/// local endpoint that was addressed. On send only `from_endpoint_name`,
/// `message` and `properties` are read; the sender fills in its own zone and node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub from_zone: String,
    pub from_node: String,
    pub from_endpoint_name: String,
    pub service_id: String,
    pub message: String,
    pub properties: HashMap<String, String>,
}

impl Message {
    pub fn new(from_endpoint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            from_endpoint_name: from_endpoint_name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The HTTP envelope.
///
/// `local*` is the writer's own side and `remote*` the other side. The sender
/// writes itself into `local*`; the receiver calls [`WireMessage::switch_remote_local`]
/// so that, from its viewpoint, `remote*` is the sender again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireMessage {
    #[serde(alias = "fromZone", deserialize_with = "null_as_default")]
    pub local_zone: String,
    #[serde(alias = "fromNode", deserialize_with = "null_as_default")]
    pub local_node: String,
    #[serde(
        alias = "fromEndpointName",
        alias = "localEndpointName",
        deserialize_with = "null_as_default"
    )]
    pub local_path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub remote_zone: String,
    #[serde(deserialize_with = "null_as_default")]
    pub remote_node: String,
    #[serde(alias = "remoteEndpointName", deserialize_with = "null_as_default")]
    pub remote_path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(deserialize_with = "null_as_default")]
    pub properties: HashMap<String, String>,
}

/// Explicit `null`s, as written by Jackson, read as the empty value
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl WireMessage {
    /// Envelope written by `(zone, node)` for delivery to `target`
    pub fn outbound(zone: &str, node: &str, target: &EndpointId, message: Message) -> Self {
        Self {
            local_zone: zone.to_string(),
            local_node: node.to_string(),
            local_path: message.from_endpoint_name,
            remote_zone: target.zone.clone(),
            remote_node: target.node.clone(),
            remote_path: target.service_id.clone(),
            message: message.message,
            properties: message.properties,
        }
    }

    pub fn switch_remote_local(&mut self) {
        std::mem::swap(&mut self.local_zone, &mut self.remote_zone);
        std::mem::swap(&mut self.local_node, &mut self.remote_node);
        std::mem::swap(&mut self.local_path, &mut self.remote_path);
    }

    /// Convert a switched envelope into the receiver's view
    pub fn into_message(self, service_id: &str) -> Message {
        Message {
            from_zone: self.remote_zone,
            from_node: self.remote_node,
            from_endpoint_name: self.remote_path,
            service_id: service_id.to_string(),
            message: self.message,
            properties: self.properties,
        }
    }
}

/// Error details carried back to the sender when a receiver fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
    #[serde(default)]
    pub stacktrace: String,
}

/// Response body: `{"r": ...}` or `{"e": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireResponse {
    #[serde(rename = "r")]
    Result(Option<String>),
    #[serde(rename = "e")]
    Error(RemoteFailure),
}

/// Local handler for messages addressed to an exported endpoint
#[async_trait]
pub trait WiringReceiver: Send + Sync {
    async fn message_received(&self, message: Message) -> anyhow::Result<Option<String>>;
}

/// Outbound handle bound to one imported endpoint
#[async_trait]
pub trait WiringSender: Send + Sync {
    async fn send_message(&self, message: Message) -> Result<Option<String>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_identity_ignores_url() {
        let id = EndpointId::new("z1", "a", "echoService", HTTP_PROTOCOL);
        let first = NodeDescriptor::new(id.clone(), url("http://host-a:8080/w/echoService"));
        let moved = NodeDescriptor::new(id, url("http://host-b:9090/w/echoService"));

        assert_eq!(first, moved);
        assert!(!first.same_location(&moved));

        let mut set = HashSet::new();
        set.insert(first);
        assert!(!set.insert(moved));
    }

    #[test]
    fn test_http_descriptor_joins_base_url() {
        let base = url("http://localhost:8080/org.inaetics.wiring.admin.http/");
        let d = NodeDescriptor::http("z1", "a", "echoService", &base).unwrap();
        assert_eq!(
            d.url().as_str(),
            "http://localhost:8080/org.inaetics.wiring.admin.http/echoService"
        );
        assert_eq!(d.protocol(), HTTP_PROTOCOL);
    }

    #[test]
    fn test_prefix_matching() {
        let id = EndpointId::new("z1", "a", "echoService", "http");
        assert!(id.matches_prefix(&[]));
        assert!(id.matches_prefix(&["z1", "a"]));
        assert!(id.matches_prefix(&["z1", "a", "echoService", "http"]));
        assert!(!id.matches_prefix(&["z1", "b"]));
        assert!(!id.matches_prefix(&["z1", "a", "echoService", "http", "url"]));
    }

    #[test]
    fn test_switch_remote_local_names_sender() {
        let target = EndpointId::new("z1", "a", "echoService", HTTP_PROTOCOL);
        let message = Message::new("echoClient", "hello");
        let mut wire = WireMessage::outbound("z1", "b", &target, message);
        wire.switch_remote_local();

        assert_eq!(wire.local_node, "a");
        let message = wire.into_message("echoService");
        assert_eq!(message.from_zone, "z1");
        assert_eq!(message.from_node, "b");
        assert_eq!(message.from_endpoint_name, "echoClient");
        assert_eq!(message.service_id, "echoService");
    }

    #[test]
    fn test_wire_message_tolerates_unknown_and_missing_fields() {
        let json = r#"{"fromZone":"z1","fromNode":"b","message":"hi","extra":42}"#;
        let wire: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(wire.local_zone, "z1");
        assert_eq!(wire.local_node, "b");
        assert!(wire.properties.is_empty());
        assert_eq!(wire.remote_path, "");
    }

    #[test]
    fn test_wire_message_reads_nulls_as_empty() {
        let json = r#"{"fromZone":"z1","fromNode":"b","fromEndpointName":null,
            "message":null,"properties":null}"#;
        let wire: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(wire.local_node, "b");
        assert_eq!(wire.local_path, "");
        assert_eq!(wire.message, "");
        assert!(wire.properties.is_empty());
    }

    #[test]
    fn test_response_envelope_shape() {
        let ok = serde_json::to_value(WireResponse::Result(Some("echo: hi".into()))).unwrap();
        assert_eq!(ok, serde_json::json!({"r": "echo: hi"}));

        let none = serde_json::to_value(WireResponse::Result(None)).unwrap();
        assert_eq!(none, serde_json::json!({"r": null}));

        let err: WireResponse =
            serde_json::from_str(r#"{"e":{"type":"ReceiverError","msg":"boom"}}"#).unwrap();
        match err {
            WireResponse::Error(f) => {
                assert_eq!(f.kind, "ReceiverError");
                assert_eq!(f.stacktrace, "");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

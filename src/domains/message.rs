use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BusError, Result};

pub type TabId = u32;

/// Semantic message kinds understood across the extension.
///
/// Serialized as the SCREAMING_SNAKE_CASE tag used on the wire, so a frame
/// produced here is readable by any context that only knows the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    InitPort,
    SidepanelReady,
    PageLoaded,
    PageData,
    TabActivated,
    TabUpdated,
    Response,
    Error,
    ContentScriptFunction,
    ContentScriptFunctionResponse,
    BackgroundFunction,
    BackgroundFunctionResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::InitPort => "INIT_PORT",
            MessageType::SidepanelReady => "SIDEPANEL_READY",
            MessageType::PageLoaded => "PAGE_LOADED",
            MessageType::PageData => "PAGE_DATA",
            MessageType::TabActivated => "TAB_ACTIVATED",
            MessageType::TabUpdated => "TAB_UPDATED",
            MessageType::Response => "RESPONSE",
            MessageType::Error => "ERROR",
            MessageType::ContentScriptFunction => "CONTENT_SCRIPT_FUNCTION",
            MessageType::ContentScriptFunctionResponse => "CONTENT_SCRIPT_FUNCTION_RESPONSE",
            MessageType::BackgroundFunction => "BACKGROUND_FUNCTION",
            MessageType::BackgroundFunctionResponse => "BACKGROUND_FUNCTION_RESPONSE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transmitted message.
///
/// `recipient_id` keeps the difference between a missing field (`None`) and
/// an explicit `null` (`Some(None)`), since both occur on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub recipient_id: Option<Option<String>>,
    #[serde(default)]
    pub one_time: bool,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value, sender_id: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            sender_id: sender_id.into(),
            recipient_id: None,
            one_time: false,
        }
    }

    /// Sets the recipient field; `None` is written as an explicit `null`.
    pub fn addressed(mut self, recipient_id: Option<&str>) -> Self {
        self.recipient_id = Some(recipient_id.map(str::to_string));
        self
    }

    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient_id.as_ref().and_then(|inner| inner.as_deref())
    }

    /// True when no recipient is set or it equals `endpoint_id`.
    pub fn is_addressed_to(&self, endpoint_id: &str) -> bool {
        match self.recipient() {
            Some(recipient) => recipient == endpoint_id,
            None => true,
        }
    }

    pub fn payload_as<P: Payload>(&self) -> Result<P> {
        if self.kind != P::KIND {
            return Err(BusError::Serialization(format!(
                "expected {} payload, got {}",
                P::KIND,
                self.kind
            )));
        }
        decode_payload(self.payload.clone())
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Option<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<String>>, D::Error> {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

/// A payload shape bound to exactly one [`MessageType`].
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    const KIND: MessageType;
}

pub fn encode_payload<P: Payload>(payload: &P) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

pub fn decode_payload<P: DeserializeOwned>(payload: Value) -> Result<P> {
    Ok(serde_json::from_value(payload)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPort {
    pub source_id: String,
}

impl Payload for InitPort {
    const KIND: MessageType = MessageType::InitPort;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidepanelReady {}

impl Payload for SidepanelReady {
    const KIND: MessageType = MessageType::SidepanelReady;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLoaded {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Payload for PageLoaded {
    const KIND: MessageType = MessageType::PageLoaded;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData {
    pub message: String,
}

impl Payload for PageData {
    const KIND: MessageType = MessageType::PageData;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabActivated {
    pub tab_id: TabId,
    pub url: String,
}

impl Payload for TabActivated {
    const KIND: MessageType = MessageType::TabActivated;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabUpdated {
    pub tab_id: TabId,
    pub url: String,
}

impl Payload for TabUpdated {
    const KIND: MessageType = MessageType::TabUpdated;
}

/// Generic acknowledgement of an earlier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub message: String,
    pub original_type: MessageType,
    #[serde(default)]
    pub original_data: Value,
}

impl Payload for Acknowledgement {
    const KIND: MessageType = MessageType::Response;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
}

impl Payload for ErrorReport {
    const KIND: MessageType = MessageType::Error;
}

/// A named function to run in a context that owns the data it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tab_id: Option<TabId>,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl FunctionCall {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            origin: None,
            target_tab_id: None,
            function_name: function_name.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
    #[serde(flatten)]
    pub call: FunctionCall,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentScriptFunction(pub FunctionCall);

impl Payload for ContentScriptFunction {
    const KIND: MessageType = MessageType::ContentScriptFunction;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentScriptFunctionResponse(pub FunctionResult);

impl Payload for ContentScriptFunctionResponse {
    const KIND: MessageType = MessageType::ContentScriptFunctionResponse;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackgroundFunction(pub FunctionCall);

impl Payload for BackgroundFunction {
    const KIND: MessageType = MessageType::BackgroundFunction;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackgroundFunctionResponse(pub FunctionResult);

impl Payload for BackgroundFunctionResponse {
    const KIND: MessageType = MessageType::BackgroundFunctionResponse;
}

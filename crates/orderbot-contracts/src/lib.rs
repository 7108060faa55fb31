use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const API_VERSION: &str = "0.1.0";

/// Name of the only field the agent platform reads back from a webhook response.
pub const FULFILLMENT_TEXT_FIELD: &str = "fulfillmentText";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    AddToOrder,
    RemoveFromOrder,
    TrackOrder,
    CompleteOrder,
}

impl IntentKind {
    pub const ALL: [IntentKind; 4] = [
        IntentKind::AddToOrder,
        IntentKind::RemoveFromOrder,
        IntentKind::TrackOrder,
        IntentKind::CompleteOrder,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            IntentKind::AddToOrder => "order.add - context:ongoing-order",
            IntentKind::RemoveFromOrder => "order.remove - context:ongoing-order",
            IntentKind::TrackOrder => "track.order - context:ongoing-tracking",
            IntentKind::CompleteOrder => "order.complete - context:ongoing-order",
        }
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.display_name() == name)
    }

    /// Short label used in logs.
    pub fn label(self) -> &'static str {
        match self {
            IntentKind::AddToOrder => "add_to_order",
            IntentKind::RemoveFromOrder => "remove_from_order",
            IntentKind::TrackOrder => "track_order",
            IntentKind::CompleteOrder => "complete_order",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub query_result: QueryResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub intent: IntentRef,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub output_contexts: Vec<OutputContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lifespan_count: Option<i64>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl WebhookRequest {
    pub fn intent_display_name(&self) -> Option<&str> {
        self.query_result.intent.display_name.as_deref()
    }

    /// Name of the first output context, which carries the session path.
    pub fn first_context_name(&self) -> Option<&str> {
        self.query_result
            .output_contexts
            .first()
            .and_then(|ctx| ctx.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    #[serde(rename = "fulfillmentText")]
    pub fulfillment_text: String,
}

impl WebhookResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            fulfillment_text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub name: String,
    pub price: String,
}

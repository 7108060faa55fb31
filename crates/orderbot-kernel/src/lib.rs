use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const RECOVERY_PROMPT: &str =
    "I'm having trouble finding your order. Sorry! Can you place a new order please?";
pub const EMPTY_ORDER_TEXT: &str = "Your order is empty";
pub const MISSING_ITEMS_TEXT: &str = "Missing food items or quantities.";
pub const MISMATCHED_ITEMS_TEXT: &str = "Food items and quantities do not match.";
pub const INVALID_QUANTITY_TEXT: &str = "Quantities must be positive whole numbers.";
pub const NOTHING_TO_REMOVE_TEXT: &str = "No food items provided to remove.";
pub const MISSING_ORDER_ID_TEXT: &str = "Please provide an order ID to track.";
pub const SAVE_FAILED_TEXT: &str =
    "Sorry, I couldn't process your order due to a backend error. Please place a new order again.";
pub const UNKNOWN_INTENT_TEXT: &str = "Unknown intent";

pub const FOOD_ITEM_PARAM: &str = "food-item";
pub const NUMBER_PARAM: &str = "number";
pub const ORDER_ID_PARAM: &str = "order_id";

/// Status written to the tracking row of a freshly saved order.
pub const INITIAL_ORDER_STATUS: &str = "in progress";

static SESSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/sessions/(.*?)/contexts/").expect("session pattern is a valid regex")
});

/// Pulls the session id out of a context path such as
/// `projects/p/agent/sessions/<id>/contexts/ongoing-order`.
pub fn extract_session_id(context_name: &str) -> Option<String> {
    SESSION_PATTERN
        .captures(context_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// In-progress order. Lines keep the position of their first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    lines: Vec<(String, i64)>,
}

impl Order {
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut order = Order::default();
        order.merge(items);
        order
    }

    /// Later quantities overwrite earlier ones for the same item.
    pub fn merge<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        for (name, quantity) in items {
            let name = name.into();
            match self.lines.iter_mut().find(|(existing, _)| *existing == name) {
                Some(line) => line.1 = quantity,
                None => self.lines.push((name, quantity)),
            }
        }
    }

    pub fn remove(&mut self, names: &[String]) -> (Vec<String>, Vec<String>) {
        let mut removed = Vec::new();
        let mut not_found = Vec::new();
        for name in names {
            match self.lines.iter().position(|(existing, _)| existing == name) {
                Some(idx) => {
                    self.lines.remove(idx);
                    removed.push(name.clone());
                }
                None => not_found.push(name.clone()),
            }
        }
        (removed, not_found)
    }

    pub fn quantity(&self, name: &str) -> Option<i64> {
        self.lines
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, qty)| *qty)
    }

    pub fn lines(&self) -> impl Iterator<Item = (&str, i64)> {
        self.lines.iter().map(|(name, qty)| (name.as_str(), *qty))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub fn format_order(order: &Order) -> String {
    if order.is_empty() {
        return EMPTY_ORDER_TEXT.to_string();
    }
    order
        .lines()
        .map(|(name, qty)| format!("{qty} {name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
    pub remaining: Order,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order store unavailable: {0}")]
    Unavailable(String),
}

/// Per-session in-progress orders. A missing session is `Ok(None)`, never an error.
pub trait OrderStore: Send {
    fn get(&self, session_id: &str) -> Result<Option<Order>, StoreError>;
    fn upsert_merge(
        &mut self,
        session_id: &str,
        items: Vec<(String, i64)>,
    ) -> Result<Order, StoreError>;
    fn remove_items(
        &mut self,
        session_id: &str,
        names: &[String],
    ) -> Result<Option<RemovalReport>, StoreError>;
    /// Removes the session and hands back whatever order it held.
    fn delete(&mut self, session_id: &str) -> Result<Option<Order>, StoreError>;
    fn len(&self) -> usize;
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl SessionPolicy {
    pub fn new(ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            ttl: Duration::milliseconds(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
            max_entries: max_entries.max(1),
        }
    }
}

struct SessionEntry {
    order: Order,
    touched_at: DateTime<Utc>,
}

pub struct MemoryOrderStore {
    entries: HashMap<String, SessionEntry>,
    policy: SessionPolicy,
    clock: Clock,
}

impl MemoryOrderStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self::with_clock(policy, Arc::new(Utc::now))
    }

    pub fn with_clock(policy: SessionPolicy, clock: Clock) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            clock,
        }
    }

    fn is_live(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        now - entry.touched_at < self.policy.ttl
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.policy.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.touched_at < ttl);
        before - self.entries.len()
    }

    fn make_room(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() >= self.policy.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn live_entry_mut(&mut self, session_id: &str, now: DateTime<Utc>) -> Option<&mut SessionEntry> {
        let ttl = self.policy.ttl;
        match self.entries.get_mut(session_id) {
            Some(entry) if now - entry.touched_at < ttl => Some(entry),
            _ => None,
        }
    }
}

impl OrderStore for MemoryOrderStore {
    fn get(&self, session_id: &str) -> Result<Option<Order>, StoreError> {
        let now = (self.clock)();
        Ok(self
            .entries
            .get(session_id)
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.order.clone()))
    }

    fn upsert_merge(
        &mut self,
        session_id: &str,
        items: Vec<(String, i64)>,
    ) -> Result<Order, StoreError> {
        let now = (self.clock)();
        let expired = self.purge_expired(now);
        let mut evicted = 0;
        if !self.entries.contains_key(session_id) {
            evicted = self.make_room();
        }
        if expired + evicted > 0 {
            debug!(
                event_name = "sessions.evicted",
                expired,
                evicted,
                remaining = self.entries.len(),
                "dropped idle in-progress orders"
            );
        }

        let entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                order: Order::default(),
                touched_at: now,
            });
        entry.order.merge(items);
        entry.touched_at = now;
        Ok(entry.order.clone())
    }

    fn remove_items(
        &mut self,
        session_id: &str,
        names: &[String],
    ) -> Result<Option<RemovalReport>, StoreError> {
        let now = (self.clock)();
        let Some(entry) = self.live_entry_mut(session_id, now) else {
            return Ok(None);
        };
        let (removed, not_found) = entry.order.remove(names);
        entry.touched_at = now;
        Ok(Some(RemovalReport {
            removed,
            not_found,
            remaining: entry.order.clone(),
        }))
    }

    fn delete(&mut self, session_id: &str) -> Result<Option<Order>, StoreError> {
        let now = (self.clock)();
        let ttl = self.policy.ttl;
        Ok(self
            .entries
            .remove(session_id)
            .filter(|entry| now - entry.touched_at < ttl)
            .map(|entry| entry.order))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddRequest {
    Missing,
    Mismatched,
    InvalidQuantity,
    Items(Vec<(String, i64)>),
}

/// Reads the `food-item` and `number` parameters of an add request.
pub fn parse_add_request(params: &Map<String, Value>) -> AddRequest {
    let names = food_items(params);
    let quantities = list_param(params, NUMBER_PARAM);
    if names.is_empty() || quantities.is_empty() {
        return AddRequest::Missing;
    }
    if names.len() != quantities.len() {
        return AddRequest::Mismatched;
    }

    let mut items = Vec::with_capacity(names.len());
    for (name, raw) in names.into_iter().zip(quantities) {
        match whole_number(raw) {
            Some(qty) if qty > 0 => items.push((name, qty)),
            _ => return AddRequest::InvalidQuantity,
        }
    }
    AddRequest::Items(items)
}

/// Food item names, accepting either a list or a single string. Blank names are skipped.
pub fn food_items(params: &Map<String, Value>) -> Vec<String> {
    list_param(params, FOOD_ITEM_PARAM)
        .into_iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// `order_id` first, then `number`. Ids below 1 count as missing.
pub fn resolve_order_id(params: &Map<String, Value>) -> Option<i64> {
    [ORDER_ID_PARAM, NUMBER_PARAM].into_iter().find_map(|key| {
        list_param(params, key)
            .into_iter()
            .next()
            .and_then(whole_number)
            .filter(|id| *id > 0)
    })
}

fn list_param<'a>(params: &'a Map<String, Value>, key: &str) -> Vec<&'a Value> {
    match params.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values.iter().collect(),
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(other) => vec![other],
    }
}

fn whole_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

pub fn add_summary_text(order: &Order) -> String {
    format!("So far you have: {}. Do you need anything else?", format_order(order))
}

pub fn removal_text(report: &RemovalReport) -> String {
    let mut parts = Vec::new();
    if !report.removed.is_empty() {
        parts.push(format!("Removed {} from your order!", report.removed.join(", ")));
    }
    if !report.not_found.is_empty() {
        parts.push(format!(
            "Your current order does not have {}.",
            report.not_found.join(", ")
        ));
    }
    if report.remaining.is_empty() {
        parts.push("Your order is now empty!".to_string());
    } else {
        parts.push(format!(
            "Here is what is left in your order: {}.",
            format_order(&report.remaining)
        ));
    }
    parts.join(" ")
}

pub fn track_text(order_id: i64, status: Option<&str>) -> String {
    match status {
        Some(status) => format!("The order status for order id: {order_id} is: {status}"),
        None => format!("No order found with order id: {order_id}"),
    }
}

pub fn completion_text(order_id: i64, total_cents: i64) -> String {
    format!(
        "Awesome. We have placed your order. Here is your order id # {order_id}. \
         Your order total is {} which you can pay at the time of delivery!",
        format_cents(total_cents)
    )
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

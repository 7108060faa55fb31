use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use orderbot_config::{Config, MenuItem};
use orderbot_contracts::{
    IntentKind, MenuEntry, WebhookRequest, WebhookResponse, API_VERSION, FULFILLMENT_TEXT_FIELD,
};
use orderbot_kernel::{
    add_summary_text, completion_text, extract_session_id, food_items, format_cents,
    parse_add_request, removal_text, resolve_order_id, track_text, AddRequest, MemoryOrderStore, Order,
    OrderStore, SessionPolicy, INITIAL_ORDER_STATUS, INVALID_QUANTITY_TEXT, MISMATCHED_ITEMS_TEXT,
    MISSING_ITEMS_TEXT, MISSING_ORDER_ID_TEXT, NOTHING_TO_REMOVE_TEXT, RECOVERY_PROMPT,
    SAVE_FAILED_TEXT, UNKNOWN_INTENT_TEXT,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(
        event_name = "system.server.started",
        listen_addr = %addr,
        "webhook server listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(event_name = "system.server.signal_error", error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!(event_name = "system.server.stopping", "shutdown requested");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(Fulfiller::from_config(&cfg)?))
}

pub fn router(fulfiller: Fulfiller) -> Router {
    Router::new()
        .route("/", post(webhook))
        .route("/v1/webhook", post(webhook))
        .route("/v1/healthz", get(healthz))
        .route("/v1/menu", get(menu))
        .route("/v1/contracts", get(contracts))
        .with_state(fulfiller)
}

/// Status and spoken text produced for one webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub status: StatusCode,
    pub text: String,
}

impl Fulfillment {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            text: text.into(),
        }
    }

    fn bad_request(text: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            text: text.into(),
        }
    }

    fn internal(text: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            text: text.into(),
        }
    }
}

/// Intent handlers plus the state they share: in-progress orders and the
/// persistence gateway.
#[derive(Clone)]
pub struct Fulfiller {
    orders: Arc<Mutex<Box<dyn OrderStore>>>,
    gateway: Arc<Mutex<StoreBackend>>,
}

impl Fulfiller {
    pub fn new(orders: Box<dyn OrderStore>, gateway: StoreBackend) -> Self {
        Self {
            orders: Arc::new(Mutex::new(orders)),
            gateway: Arc::new(Mutex::new(gateway)),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let mut gateway = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        gateway.seed_menu(&cfg.menu)?;

        let policy = SessionPolicy::new(cfg.sessions.ttl_ms, cfg.sessions.max_entries);
        Ok(Self::new(Box::new(MemoryOrderStore::new(policy)), gateway))
    }

    /// Routes one webhook request to its intent handler. Never fails: every
    /// error becomes a fulfillment with a 4xx/5xx status.
    pub async fn dispatch(&self, request: &WebhookRequest) -> Fulfillment {
        let session_id = request.first_context_name().and_then(extract_session_id);
        let display_name = request.intent_display_name().unwrap_or_default();
        let Some(intent) = IntentKind::from_display_name(display_name) else {
            warn!(
                event_name = "webhook.unknown_intent",
                intent = display_name,
                "no handler for intent"
            );
            return Fulfillment::bad_request(UNKNOWN_INTENT_TEXT);
        };

        info!(
            event_name = "webhook.dispatch",
            intent = intent.label(),
            session_id = session_id.as_deref().unwrap_or("unknown"),
            "dispatching intent"
        );
        match self
            .handle(intent, &request.query_result.parameters, session_id.as_deref())
            .await
        {
            Ok(fulfillment) => fulfillment,
            Err(e) => {
                warn!(
                    event_name = "webhook.failed",
                    intent = intent.label(),
                    error = %e,
                    "intent handler failed"
                );
                Fulfillment::internal(format!("Internal Server Error: {e}"))
            }
        }
    }

    pub async fn handle(
        &self,
        intent: IntentKind,
        params: &Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Fulfillment, String> {
        match intent {
            IntentKind::AddToOrder => self.add_to_order(params, session_id).await,
            IntentKind::RemoveFromOrder => self.remove_from_order(params, session_id).await,
            IntentKind::TrackOrder => self.track_order(params, session_id).await,
            IntentKind::CompleteOrder => self.complete_order(params, session_id).await,
        }
    }

    pub async fn add_to_order(
        &self,
        params: &Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Fulfillment, String> {
        let items = match parse_add_request(params) {
            AddRequest::Missing => return Ok(Fulfillment::bad_request(MISSING_ITEMS_TEXT)),
            AddRequest::Mismatched => return Ok(Fulfillment::bad_request(MISMATCHED_ITEMS_TEXT)),
            AddRequest::InvalidQuantity => {
                return Ok(Fulfillment::bad_request(INVALID_QUANTITY_TEXT))
            }
            AddRequest::Items(items) => items,
        };
        let Some(session_id) = session_id else {
            return Ok(Fulfillment::ok(RECOVERY_PROMPT));
        };

        let merged = self.orders.lock().await.upsert_merge(session_id, items);
        match merged {
            Ok(order) => {
                info!(
                    event_name = "order.items_added",
                    session_id,
                    line_count = order.len(),
                    "in-progress order updated"
                );
                Ok(Fulfillment::ok(add_summary_text(&order)))
            }
            Err(e) => Ok(Fulfillment::internal(format!("Error adding to order: {e}"))),
        }
    }

    pub async fn remove_from_order(
        &self,
        params: &Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Fulfillment, String> {
        let Some(session_id) = session_id else {
            return Ok(Fulfillment::ok(RECOVERY_PROMPT));
        };
        let names = food_items(params);

        let mut orders = self.orders.lock().await;
        if names.is_empty() {
            let exists = orders.get(session_id).map_err(|e| e.to_string())?.is_some();
            return Ok(Fulfillment::ok(if exists {
                NOTHING_TO_REMOVE_TEXT
            } else {
                RECOVERY_PROMPT
            }));
        }

        let report = orders
            .remove_items(session_id, &names)
            .map_err(|e| e.to_string())?;
        drop(orders);

        match report {
            Some(report) => {
                info!(
                    event_name = "order.items_removed",
                    session_id,
                    removed = report.removed.len(),
                    not_found = report.not_found.len(),
                    remaining = report.remaining.len(),
                    "in-progress order updated"
                );
                Ok(Fulfillment::ok(removal_text(&report)))
            }
            None => Ok(Fulfillment::ok(RECOVERY_PROMPT)),
        }
    }

    pub async fn track_order(
        &self,
        params: &Map<String, Value>,
        _session_id: Option<&str>,
    ) -> Result<Fulfillment, String> {
        let Some(order_id) = resolve_order_id(params) else {
            return Ok(Fulfillment::bad_request(MISSING_ORDER_ID_TEXT));
        };

        let status = self.gateway.lock().await.get_order_status(order_id);
        match status {
            Ok(status) => Ok(Fulfillment::ok(track_text(order_id, status.as_deref()))),
            Err(e) => {
                warn!(
                    event_name = "order.track_failed",
                    order_id,
                    error = %e,
                    "order status lookup failed"
                );
                Ok(Fulfillment::internal(format!("Error tracking order: {e}")))
            }
        }
    }

    pub async fn complete_order(
        &self,
        _params: &Map<String, Value>,
        session_id: Option<&str>,
    ) -> Result<Fulfillment, String> {
        let Some(session_id) = session_id else {
            return Ok(Fulfillment::ok(RECOVERY_PROMPT));
        };

        // The session is cleared before saving so a failed save still leaves no order behind.
        let taken = self
            .orders
            .lock()
            .await
            .delete(session_id)
            .map_err(|e| e.to_string())?;
        let order = match taken {
            Some(order) if !order.is_empty() => order,
            _ => return Ok(Fulfillment::ok(RECOVERY_PROMPT)),
        };

        let mut gateway = self.gateway.lock().await;
        match gateway.save_order(&order) {
            SaveOutcome::Saved { order_id } => {
                let total_cents = gateway.get_total_order_price(order_id)?;
                drop(gateway);
                info!(
                    event_name = "order.saved",
                    session_id,
                    order_id,
                    line_count = order.len(),
                    total = %format_cents(total_cents),
                    "order persisted"
                );
                Ok(Fulfillment::ok(completion_text(order_id, total_cents)))
            }
            SaveOutcome::Failed { reason } => {
                drop(gateway);
                warn!(
                    event_name = "order.save_failed",
                    session_id,
                    reason = %reason,
                    "order could not be persisted"
                );
                Ok(Fulfillment::ok(SAVE_FAILED_TEXT))
            }
        }
    }

    pub async fn menu(&self) -> Result<Vec<MenuEntry>, String> {
        let items = self.gateway.lock().await.list_menu()?;
        Ok(items
            .into_iter()
            .map(|(name, price_cents)| MenuEntry {
                name,
                price: format_cents(price_cents),
            })
            .collect())
    }
}

async fn webhook(
    State(fulfiller): State<Fulfiller>,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("webhook", request_id = %request_id);

    let fulfillment = async {
        match serde_json::from_slice::<WebhookRequest>(&body) {
            Ok(request) => fulfiller.dispatch(&request).await,
            Err(e) => {
                warn!(
                    event_name = "webhook.invalid_payload",
                    error = %e,
                    "webhook body is not a valid request"
                );
                Fulfillment::internal(format!("Internal Server Error: {e}"))
            }
        }
    }
    .instrument(span)
    .await;

    (
        fulfillment.status,
        Json(WebhookResponse::new(fulfillment.text)),
    )
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn menu(
    State(fulfiller): State<Fulfiller>,
) -> Result<Json<Vec<MenuEntry>>, (StatusCode, Json<Value>)> {
    fulfiller.menu().await.map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"code":"gateway_error","message": e}})),
        )
    })
}

async fn contracts() -> Json<Value> {
    Json(json!({
        "version": API_VERSION,
        "intents": IntentKind::ALL
            .iter()
            .map(|kind| kind.display_name())
            .collect::<Vec<_>>(),
        "response_field": FULFILLMENT_TEXT_FIELD,
    }))
}

/// Result of writing one order line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemInsert {
    Inserted,
    Rejected { reason: String },
}

/// Result of the save routine. A failed save leaves nothing behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { order_id: i64 },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
struct LineItem {
    order_id: i64,
    name: String,
    quantity: i64,
    total_cents: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    menu: Vec<(String, i64)>,
    line_items: Vec<LineItem>,
    tracking: HashMap<i64, String>,
}

pub struct SqliteStore {
    conn: Connection,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn memory() -> Self {
        StoreBackend::Memory(MemoryStore::default())
    }

    pub fn sqlite(path: &str) -> Result<Self, String> {
        Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
    }

    /// Inserts or reprices menu items; existing items keep their ids.
    pub fn seed_menu(&mut self, items: &[MenuItem]) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                for item in items {
                    let name = item.name.trim();
                    match store.menu.iter_mut().find(|(existing, _)| existing == name) {
                        Some(entry) => entry.1 = item.price_cents,
                        None => store.menu.push((name.to_string(), item.price_cents)),
                    }
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.seed_menu(items),
        }
    }

    pub fn list_menu(&self) -> Result<Vec<(String, i64)>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.menu.clone()),
            StoreBackend::Sqlite(store) => store.list_menu(),
        }
    }

    pub fn get_next_order_id(&self) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.next_order_id()),
            StoreBackend::Sqlite(store) => next_order_id(&store.conn),
        }
    }

    pub fn insert_order_item(
        &mut self,
        name: &str,
        quantity: i64,
        order_id: i64,
    ) -> Result<ItemInsert, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.insert_order_item(name, quantity, order_id)),
            StoreBackend::Sqlite(store) => {
                insert_order_item(&store.conn, name, quantity, order_id)
            }
        }
    }

    pub fn insert_order_tracking(&mut self, order_id: i64, status: &str) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.tracking.insert(order_id, status.to_string());
                Ok(())
            }
            StoreBackend::Sqlite(store) => insert_order_tracking(&store.conn, order_id, status),
        }
    }

    /// Sum of line totals in cents.
    pub fn get_total_order_price(&self, order_id: i64) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => store.order_total(order_id),
            StoreBackend::Sqlite(store) => total_order_price(&store.conn, order_id),
        }
    }

    /// Persisted `(item, quantity)` lines of an order, in insertion order.
    pub fn list_order_lines(&self, order_id: i64) -> Result<Vec<(String, i64)>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .line_items
                .iter()
                .filter(|line| line.order_id == order_id)
                .map(|line| (line.name.clone(), line.quantity))
                .collect()),
            StoreBackend::Sqlite(store) => order_lines(&store.conn, order_id),
        }
    }

    pub fn get_order_status(&self, order_id: i64) -> Result<Option<String>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.tracking.get(&order_id).cloned()),
            StoreBackend::Sqlite(store) => order_status(&store.conn, order_id),
        }
    }

    /// Allocates an order id, writes every line and the tracking row. Any
    /// rejected line or gateway error rolls the whole order back.
    pub fn save_order(&mut self, order: &Order) -> SaveOutcome {
        let result = match self {
            StoreBackend::Memory(store) => store.save_order(order),
            StoreBackend::Sqlite(store) => store.save_order(order),
        };
        match result {
            Ok(outcome) => outcome,
            Err(reason) => SaveOutcome::Failed { reason },
        }
    }
}

impl MemoryStore {
    fn next_order_id(&self) -> i64 {
        self.line_items
            .iter()
            .map(|line| line.order_id)
            .chain(self.tracking.keys().copied())
            .max()
            .unwrap_or(0)
            + 1
    }

    fn insert_order_item(&mut self, name: &str, quantity: i64, order_id: i64) -> ItemInsert {
        if quantity <= 0 {
            return ItemInsert::Rejected {
                reason: format!("invalid quantity {quantity} for {name}"),
            };
        }
        let Some(price_cents) = self
            .menu
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, price)| *price)
        else {
            return ItemInsert::Rejected {
                reason: format!("unknown food item: {name}"),
            };
        };
        let Some(total_cents) = price_cents.checked_mul(quantity) else {
            return ItemInsert::Rejected {
                reason: format!("line total overflows for {quantity} {name}"),
            };
        };
        self.line_items.push(LineItem {
            order_id,
            name: name.to_string(),
            quantity,
            total_cents,
        });
        ItemInsert::Inserted
    }

    fn order_total(&self, order_id: i64) -> Result<i64, String> {
        self.line_items
            .iter()
            .filter(|line| line.order_id == order_id)
            .try_fold(0i64, |acc, line| acc.checked_add(line.total_cents))
            .ok_or_else(|| format!("order total overflows for order {order_id}"))
    }

    fn save_order(&mut self, order: &Order) -> Result<SaveOutcome, String> {
        let order_id = self.next_order_id();
        let checkpoint = self.line_items.len();
        for (name, quantity) in order.lines() {
            if let ItemInsert::Rejected { reason } = self.insert_order_item(name, quantity, order_id)
            {
                self.line_items.truncate(checkpoint);
                return Ok(SaveOutcome::Failed { reason });
            }
        }
        if let Err(reason) = self.order_total(order_id) {
            self.line_items.truncate(checkpoint);
            return Ok(SaveOutcome::Failed { reason });
        }
        self.tracking
            .insert(order_id, INITIAL_ORDER_STATUS.to_string());
        Ok(SaveOutcome::Saved { order_id })
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS food_items (
                item_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                price_cents INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS orders (
                order_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL REFERENCES food_items(item_id),
                quantity INTEGER NOT NULL,
                total_price_cents INTEGER NOT NULL,
                PRIMARY KEY (order_id, item_id)
            );
            CREATE TABLE IF NOT EXISTS order_tracking (
                order_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn seed_menu(&mut self, items: &[MenuItem]) -> Result<(), String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        for item in items {
            tx.execute(
                "INSERT INTO food_items (name, price_cents) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET price_cents = excluded.price_cents",
                params![item.name.trim(), item.price_cents],
            )
            .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())
    }

    fn list_menu(&self) -> Result<Vec<(String, i64)>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, price_cents FROM food_items ORDER BY item_id")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn save_order(&mut self, order: &Order) -> Result<SaveOutcome, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let order_id = next_order_id(&tx)?;
        for (name, quantity) in order.lines() {
            if let ItemInsert::Rejected { reason } =
                insert_order_item(&tx, name, quantity, order_id)?
            {
                // Dropping the transaction rolls back the lines written so far.
                return Ok(SaveOutcome::Failed { reason });
            }
        }
        // SUM raises on integer overflow, which rejects the order before it is tracked.
        if let Err(reason) = total_order_price(&tx, order_id) {
            return Ok(SaveOutcome::Failed { reason });
        }
        insert_order_tracking(&tx, order_id, INITIAL_ORDER_STATUS)?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(SaveOutcome::Saved { order_id })
    }
}

fn next_order_id(conn: &Connection) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(order_id), 0) + 1 FROM (
             SELECT order_id FROM orders UNION ALL SELECT order_id FROM order_tracking
         )",
        [],
        |row| row.get(0),
    )
    .map_err(|e| e.to_string())
}

fn insert_order_item(
    conn: &Connection,
    name: &str,
    quantity: i64,
    order_id: i64,
) -> Result<ItemInsert, String> {
    if quantity <= 0 {
        return Ok(ItemInsert::Rejected {
            reason: format!("invalid quantity {quantity} for {name}"),
        });
    }
    let item: Option<(i64, i64)> = conn
        .query_row(
            "SELECT item_id, price_cents FROM food_items WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    let Some((item_id, price_cents)) = item else {
        return Ok(ItemInsert::Rejected {
            reason: format!("unknown food item: {name}"),
        });
    };
    let Some(total_cents) = price_cents.checked_mul(quantity) else {
        return Ok(ItemInsert::Rejected {
            reason: format!("line total overflows for {quantity} {name}"),
        });
    };
    conn.execute(
        "INSERT INTO orders (order_id, item_id, quantity, total_price_cents)
         VALUES (?1, ?2, ?3, ?4)",
        params![order_id, item_id, quantity, total_cents],
    )
    .map_err(|e| e.to_string())?;
    Ok(ItemInsert::Inserted)
}

fn insert_order_tracking(conn: &Connection, order_id: i64, status: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO order_tracking (order_id, status, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(order_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        params![order_id, status, Utc::now().to_rfc3339()],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn total_order_price(conn: &Connection, order_id: i64) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(SUM(total_price_cents), 0) FROM orders WHERE order_id = ?1",
        params![order_id],
        |row| row.get(0),
    )
    .map_err(|e| e.to_string())
}

fn order_lines(conn: &Connection, order_id: i64) -> Result<Vec<(String, i64)>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT f.name, o.quantity FROM orders o
             JOIN food_items f ON f.item_id = o.item_id
             WHERE o.order_id = ?1 ORDER BY o.rowid",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![order_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| e.to_string())?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

fn order_status(conn: &Connection, order_id: i64) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT status FROM order_tracking WHERE order_id = ?1",
        params![order_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderbot_kernel::{RemovalReport, StoreError};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn menu_items() -> Vec<MenuItem> {
        vec![
            MenuItem {
                name: "Pizza".to_string(),
                price_cents: 800,
            },
            MenuItem {
                name: "Pasta".to_string(),
                price_cents: 650,
            },
            MenuItem {
                name: "Mango Lassi".to_string(),
                price_cents: 500,
            },
        ]
    }

    fn temp_db_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("orderbot-server-test-{nanos}.db"))
            .to_string_lossy()
            .to_string()
    }

    fn memory_gateway() -> StoreBackend {
        let mut gateway = StoreBackend::memory();
        gateway.seed_menu(&menu_items()).unwrap();
        gateway
    }

    fn sqlite_gateway() -> StoreBackend {
        let mut gateway = StoreBackend::sqlite(&temp_db_path()).unwrap();
        gateway.seed_menu(&menu_items()).unwrap();
        gateway
    }

    fn fulfiller(gateway: StoreBackend) -> Fulfiller {
        Fulfiller::new(
            Box::new(MemoryOrderStore::new(SessionPolicy::new(60_000, 100))),
            gateway,
        )
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn session_order(f: &Fulfiller, session_id: &str) -> Option<Order> {
        f.orders.lock().await.get(session_id).unwrap()
    }

    #[tokio::test]
    async fn repeated_add_overwrites_quantities() {
        let f = fulfiller(memory_gateway());
        f.add_to_order(
            &params(json!({"food-item": ["Pizza", "Pasta"], "number": [2, 1]})),
            Some("s1"),
        )
        .await
        .unwrap();
        let res = f
            .add_to_order(&params(json!({"food-item": ["Pizza"], "number": [5]})), Some("s1"))
            .await
            .unwrap();

        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(
            res.text,
            "So far you have: 5 Pizza, 1 Pasta. Do you need anything else?"
        );
        assert_eq!(
            session_order(&f, "s1").await,
            Some(Order::from_items([("Pizza", 5), ("Pasta", 1)]))
        );
    }

    #[tokio::test]
    async fn add_rejects_missing_or_mismatched_lists() {
        let f = fulfiller(memory_gateway());
        let missing = f
            .add_to_order(&params(json!({"food-item": ["Pizza"]})), Some("s1"))
            .await
            .unwrap();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        assert_eq!(missing.text, MISSING_ITEMS_TEXT);

        let mismatched = f
            .add_to_order(
                &params(json!({"food-item": ["Pizza", "Pasta"], "number": [1]})),
                Some("s1"),
            )
            .await
            .unwrap();
        assert_eq!(mismatched.status, StatusCode::BAD_REQUEST);
        assert_eq!(mismatched.text, MISMATCHED_ITEMS_TEXT);
        assert!(session_order(&f, "s1").await.is_none());
    }

    #[tokio::test]
    async fn add_without_session_asks_for_a_new_order() {
        let f = fulfiller(memory_gateway());
        let res = f
            .add_to_order(&params(json!({"food-item": ["Pizza"], "number": [1]})), None)
            .await
            .unwrap();
        assert_eq!(res, Fulfillment::ok(RECOVERY_PROMPT));
    }

    #[tokio::test]
    async fn unknown_sessions_get_recovery_prompt() {
        let f = fulfiller(memory_gateway());
        let remove = f
            .remove_from_order(&params(json!({"food-item": ["Pizza"]})), Some("ghost"))
            .await
            .unwrap();
        assert_eq!(remove, Fulfillment::ok(RECOVERY_PROMPT));

        let remove_nothing = f
            .remove_from_order(&params(json!({})), Some("ghost"))
            .await
            .unwrap();
        assert_eq!(remove_nothing, Fulfillment::ok(RECOVERY_PROMPT));

        let complete = f.complete_order(&Map::new(), Some("ghost")).await.unwrap();
        assert_eq!(complete, Fulfillment::ok(RECOVERY_PROMPT));

        let complete_no_session = f.complete_order(&Map::new(), None).await.unwrap();
        assert_eq!(complete_no_session, Fulfillment::ok(RECOVERY_PROMPT));
    }

    #[tokio::test]
    async fn remove_reports_partial_matches() {
        let f = fulfiller(memory_gateway());
        f.add_to_order(
            &params(json!({"food-item": ["Pizza", "Mango Lassi"], "number": [2, 1]})),
            Some("s1"),
        )
        .await
        .unwrap();

        let res = f
            .remove_from_order(&params(json!({"food-item": ["Pizza", "Samosa"]})), Some("s1"))
            .await
            .unwrap();
        assert_eq!(
            res.text,
            "Removed Pizza from your order! Your current order does not have Samosa. \
             Here is what is left in your order: 1 Mango Lassi."
        );

        let emptied = f
            .remove_from_order(&params(json!({"food-item": ["Mango Lassi"]})), Some("s1"))
            .await
            .unwrap();
        assert_eq!(
            emptied.text,
            "Removed Mango Lassi from your order! Your order is now empty!"
        );
    }

    #[tokio::test]
    async fn remove_with_no_items_is_a_no_op() {
        let f = fulfiller(memory_gateway());
        f.add_to_order(&params(json!({"food-item": ["Pizza"], "number": [1]})), Some("s1"))
            .await
            .unwrap();
        let res = f
            .remove_from_order(&params(json!({"food-item": []})), Some("s1"))
            .await
            .unwrap();
        assert_eq!(res, Fulfillment::ok(NOTHING_TO_REMOVE_TEXT));
        assert!(session_order(&f, "s1").await.is_some());
    }

    #[tokio::test]
    async fn complete_saves_order_and_clears_session() {
        for gateway in [memory_gateway(), sqlite_gateway()] {
            let f = fulfiller(gateway);
            f.add_to_order(
                &params(json!({"food-item": ["Pizza", "Mango Lassi"], "number": [2, 1]})),
                Some("s1"),
            )
            .await
            .unwrap();

            let res = f.complete_order(&Map::new(), Some("s1")).await.unwrap();
            assert_eq!(res.status, StatusCode::OK);
            assert_eq!(res.text, completion_text(1, 2100));
            assert!(session_order(&f, "s1").await.is_none());

            let gateway = f.gateway.lock().await;
            assert_eq!(
                gateway.get_order_status(1).unwrap().as_deref(),
                Some(INITIAL_ORDER_STATUS)
            );
            assert_eq!(gateway.get_next_order_id().unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn failed_save_still_clears_session_and_writes_nothing() {
        for gateway in [memory_gateway(), sqlite_gateway()] {
            let f = fulfiller(gateway);
            f.add_to_order(
                &params(json!({"food-item": ["Pizza", "Unicorn Steak"], "number": [1, 1]})),
                Some("s1"),
            )
            .await
            .unwrap();

            let res = f.complete_order(&Map::new(), Some("s1")).await.unwrap();
            assert_eq!(res, Fulfillment::ok(SAVE_FAILED_TEXT));
            assert!(session_order(&f, "s1").await.is_none());

            let gateway = f.gateway.lock().await;
            assert_eq!(gateway.get_total_order_price(1).unwrap(), 0);
            assert_eq!(gateway.get_order_status(1).unwrap(), None);
            assert_eq!(gateway.get_next_order_id().unwrap(), 1);
        }
    }

    #[test]
    fn save_rolls_back_partial_lines() {
        for mut gateway in [memory_gateway(), sqlite_gateway()] {
            let order = Order::from_items([("Pizza", 1), ("Pasta", 2), ("Nope", 1)]);
            let outcome = gateway.save_order(&order);
            assert!(
                matches!(outcome, SaveOutcome::Failed { ref reason } if reason.contains("Nope"))
            );
            assert!(gateway.list_order_lines(1).unwrap().is_empty());
        }
    }

    #[test]
    fn saved_lines_keep_item_and_quantity() {
        for mut gateway in [memory_gateway(), sqlite_gateway()] {
            let order = Order::from_items([("Pasta", 2), ("Pizza", 1)]);
            assert_eq!(gateway.save_order(&order), SaveOutcome::Saved { order_id: 1 });
            assert_eq!(
                gateway.list_order_lines(1).unwrap(),
                vec![("Pasta".to_string(), 2), ("Pizza".to_string(), 1)]
            );
        }
    }

    #[test]
    fn overflowing_totals_fail_the_save() {
        for mut gateway in [memory_gateway(), sqlite_gateway()] {
            let huge_line = Order::from_items([("Pizza", 4_000_000_000_000_000_000)]);
            assert!(matches!(
                gateway.save_order(&huge_line),
                SaveOutcome::Failed { ref reason } if reason.contains("overflows")
            ));

            // Each line fits on its own but their sum does not.
            let huge_sum = Order::from_items([
                ("Pizza", i64::MAX / 800),
                ("Mango Lassi", i64::MAX / 500),
            ]);
            assert!(matches!(gateway.save_order(&huge_sum), SaveOutcome::Failed { .. }));

            assert!(gateway.list_order_lines(1).unwrap().is_empty());
            assert_eq!(gateway.get_order_status(1).unwrap(), None);
            assert_eq!(gateway.get_next_order_id().unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn huge_quantity_completion_answers_with_backend_error() {
        for gateway in [memory_gateway(), sqlite_gateway()] {
            let f = fulfiller(gateway);
            let added = f
                .add_to_order(
                    &params(json!({"food-item": ["Pizza"], "number": [4_000_000_000_000_000_000i64]})),
                    Some("s1"),
                )
                .await
                .unwrap();
            assert_eq!(added.status, StatusCode::OK);

            let res = f.complete_order(&Map::new(), Some("s1")).await.unwrap();
            assert_eq!(res, Fulfillment::ok(SAVE_FAILED_TEXT));
            assert!(session_order(&f, "s1").await.is_none());
        }
    }

    struct UnavailableStore;

    impl OrderStore for UnavailableStore {
        fn get(&self, _session_id: &str) -> Result<Option<Order>, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        fn upsert_merge(
            &mut self,
            _session_id: &str,
            _items: Vec<(String, i64)>,
        ) -> Result<Order, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        fn remove_items(
            &mut self,
            _session_id: &str,
            _names: &[String],
        ) -> Result<Option<RemovalReport>, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        fn delete(&mut self, _session_id: &str) -> Result<Option<Order>, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn handler_failures_become_internal_server_errors() {
        let f = Fulfiller::new(Box::new(UnavailableStore), memory_gateway());
        for intent in [IntentKind::RemoveFromOrder, IntentKind::CompleteOrder] {
            let request: WebhookRequest = serde_json::from_value(json!({
                "queryResult": {
                    "intent": {"displayName": intent.display_name()},
                    "parameters": {"food-item": ["Pizza"]},
                    "outputContexts": [{"name": "projects/p/agent/sessions/s1/contexts/ongoing-order"}]
                }
            }))
            .unwrap();
            let res = f.dispatch(&request).await;
            assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                res.text,
                "Internal Server Error: order store unavailable: connection reset"
            );
        }
    }

    #[test]
    fn gateway_rejects_unknown_items_without_erroring() {
        let mut gateway = sqlite_gateway();
        assert_eq!(
            gateway.insert_order_item("Pizza", 2, 7).unwrap(),
            ItemInsert::Inserted
        );
        assert!(matches!(
            gateway.insert_order_item("Ghost Pepper", 1, 7).unwrap(),
            ItemInsert::Rejected { .. }
        ));
        assert_eq!(gateway.get_total_order_price(7).unwrap(), 1600);
        assert_eq!(gateway.get_next_order_id().unwrap(), 8);
    }

    #[tokio::test]
    async fn track_order_resolves_id_and_reports_status() {
        let mut gateway = memory_gateway();
        gateway.insert_order_tracking(41, "delivered").unwrap();
        let f = fulfiller(gateway);

        let found = f
            .track_order(&params(json!({"order_id": 41.0})), None)
            .await
            .unwrap();
        assert_eq!(
            found,
            Fulfillment::ok("The order status for order id: 41 is: delivered")
        );

        let fallback = f
            .track_order(&params(json!({"number": [41]})), None)
            .await
            .unwrap();
        assert_eq!(fallback.status, StatusCode::OK);

        let missing = f
            .track_order(&params(json!({"order_id": 99})), None)
            .await
            .unwrap();
        assert_eq!(missing, Fulfillment::ok("No order found with order id: 99"));

        let unresolvable = f.track_order(&params(json!({})), None).await.unwrap();
        assert_eq!(unresolvable, Fulfillment::bad_request(MISSING_ORDER_ID_TEXT));
    }

    #[tokio::test]
    async fn track_order_gateway_failure_is_500() {
        let gateway = sqlite_gateway();
        if let StoreBackend::Sqlite(store) = &gateway {
            store
                .conn
                .execute_batch("DROP TABLE order_tracking;")
                .unwrap();
        }
        let f = fulfiller(gateway);
        let res = f
            .track_order(&params(json!({"order_id": 1})), None)
            .await
            .unwrap();
        assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.text.starts_with("Error tracking order: "));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_intent() {
        let f = fulfiller(memory_gateway());
        let request: WebhookRequest = serde_json::from_value(json!({
            "queryResult": {
                "intent": {"displayName": "order.cancel"},
                "parameters": {"food-item": ["Pizza"], "number": [1]},
                "outputContexts": [{"name": "projects/p/agent/sessions/s1/contexts/ongoing-order"}]
            }
        }))
        .unwrap();
        assert_eq!(
            f.dispatch(&request).await,
            Fulfillment::bad_request(UNKNOWN_INTENT_TEXT)
        );
    }

    #[tokio::test]
    async fn dispatch_uses_session_from_first_context() {
        let f = fulfiller(memory_gateway());
        let request: WebhookRequest = serde_json::from_value(json!({
            "queryResult": {
                "intent": {"displayName": IntentKind::AddToOrder.display_name()},
                "parameters": {"food-item": ["Pizza"], "number": [3]},
                "outputContexts": [
                    {"name": "projects/p/agent/sessions/abc-123/contexts/ongoing-order"},
                    {"name": "projects/p/agent/sessions/other/contexts/__system_counters__"}
                ]
            }
        }))
        .unwrap();
        let res = f.dispatch(&request).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(
            session_order(&f, "abc-123").await,
            Some(Order::from_items([("Pizza", 3)]))
        );
        assert!(session_order(&f, "other").await.is_none());
    }

    #[tokio::test]
    async fn menu_lists_seeded_items_with_prices() {
        let f = fulfiller(sqlite_gateway());
        let menu = f.menu().await.unwrap();
        assert_eq!(menu.len(), 3);
        assert_eq!(menu[0].name, "Pizza");
        assert_eq!(menu[0].price, "8.00");
        assert_eq!(menu[1].price, "6.50");
    }
}

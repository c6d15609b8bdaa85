//! The buffered send path.
//!
//! `send` never talks to the database. Messages land in a per-scope buffer
//! (living in the scope's item bag) and a single on-commit callback flushes
//! the whole buffer over one connection, in enqueue order. Header parsing
//! happens at send time so a malformed message fails the sender rather than
//! poisoning the flush.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use courier_core::{
    encode_headers, headers, TransactionScope, TransportError, TransportMessage,
    MAGIC_DEFERRAL_ADDRESS,
};
use tracing::debug;

use super::MySqlTransport;
use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;

const OUTGOING_ITEM_KEY: &str = "courier-mysql-outgoing";

/// TTL applied when the sender did not set one: effectively forever.
const DEFAULT_TTL_SECONDS: i64 = i32::MAX as i64;

/// A message resolved and validated at send time, awaiting the flush.
#[derive(Debug)]
struct OutgoingMessage {
    destination: TableName,
    headers_blob: Vec<u8>,
    body: Vec<u8>,
    priority: i32,
    ordering_key: Option<String>,
    visibility_delay_micros: i64,
    ttl_micros: i64,
}

type OutgoingBuffer = Mutex<Vec<OutgoingMessage>>;

pub(super) async fn send(
    transport: &MySqlTransport,
    destination: &str,
    message: TransportMessage,
    scope: &Arc<TransactionScope>,
) -> Result<(), TransportError> {
    let outgoing = prepare(destination, message)?;

    let buffer = match scope.get_item::<OutgoingBuffer>(OUTGOING_ITEM_KEY) {
        Some(buffer) => buffer,
        None => {
            // First send on this scope: create the buffer and hook the
            // flush to the scope's commit.
            let buffer: Arc<OutgoingBuffer> =
                scope.get_or_insert_item_with(OUTGOING_ITEM_KEY, || Mutex::new(Vec::new()));
            let provider = Arc::clone(transport.provider());
            let flush_from = Arc::clone(&buffer);
            scope.on_committed(move || flush(provider, flush_from));
            buffer
        }
    };

    buffer
        .lock()
        .expect("outgoing buffer mutex poisoned")
        .push(outgoing);
    Ok(())
}

/// Resolve the destination, interpret and strip scheduling headers, and
/// serialize what remains.
fn prepare(destination: &str, mut message: TransportMessage) -> Result<OutgoingMessage, TransportError> {
    let destination = resolve_destination(destination, &message)?;
    let destination = TableName::parse(&destination)?;

    let priority = message.priority()?;
    let deferred_until = message.deferred_until()?;
    message.headers.remove(headers::DEFERRED_UNTIL);
    // A deferral in the past yields a negative delay on purpose: the row
    // becomes visible immediately, but its `visible` column still reflects
    // the requested instant, which is what orders same-priority deliveries.
    let visibility_delay_micros = match deferred_until {
        Some(due) => (due - Utc::now()).num_microseconds().unwrap_or(i64::MAX),
        None => 0,
    };

    let ttl_micros = match message.time_to_be_received()? {
        Some(ttl) => ttl.num_microseconds().unwrap_or(i64::MAX),
        None => DEFAULT_TTL_SECONDS.saturating_mul(1_000_000),
    };
    if ttl_micros <= visibility_delay_micros {
        return Err(TransportError::MalformedMessage(format!(
            "message deferred past its own time-to-be-received \
             (visible in {visibility_delay_micros} us, expires in {ttl_micros} us)"
        )));
    }

    let ordering_key = message.ordering_key().map(str::to_owned);

    Ok(OutgoingMessage {
        headers_blob: encode_headers(&message.headers),
        body: message.body,
        destination,
        priority,
        ordering_key,
        visibility_delay_micros,
        ttl_micros,
    })
}

/// Deferred sends addressed to the timeout-manager sentinel are rewritten
/// to the recipient the deferral headers name. A deferral without a
/// recipient is a bug in the sender.
fn resolve_destination(
    destination: &str,
    message: &TransportMessage,
) -> Result<String, TransportError> {
    if !destination.trim().eq_ignore_ascii_case(MAGIC_DEFERRAL_ADDRESS) {
        return Ok(destination.to_string());
    }
    message
        .headers
        .get(headers::DEFERRED_RECIPIENT)
        .cloned()
        .ok_or_else(|| {
            TransportError::MalformedMessage(format!(
                "deferred message carries no '{}' header",
                headers::DEFERRED_RECIPIENT
            ))
        })
}

async fn flush(
    provider: Arc<MySqlConnectionProvider>,
    buffer: Arc<OutgoingBuffer>,
) -> anyhow::Result<()> {
    let messages = std::mem::take(
        &mut *buffer.lock().expect("outgoing buffer mutex poisoned"),
    );
    if messages.is_empty() {
        return Ok(());
    }

    let count = messages.len();
    let mut conn = provider.begin().await?;
    for message in &messages {
        sqlx::query(&insert_sql(&message.destination))
            .bind(&message.headers_blob)
            .bind(&message.body)
            .bind(message.priority)
            .bind(message.ordering_key.as_deref())
            .bind(message.visibility_delay_micros)
            .bind(message.ttl_micros)
            .execute(conn.conn())
            .await?;
    }
    conn.complete().await?;
    debug!(count, "flushed outgoing messages");
    Ok(())
}

fn insert_sql(destination: &TableName) -> String {
    format!(
        "INSERT INTO {} \
         (`headers`, `body`, `priority`, `ordering_key`, `visible`, `expiration`, `leased_until`, `leased_by`, `leased_at`) \
         VALUES (?, ?, ?, ?, \
         DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
         DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
         NULL, NULL, NULL)",
        destination.qualified()
    )
}

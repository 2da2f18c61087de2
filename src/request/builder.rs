use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::timestamp::TimestampGenerator;

/// A JSON object used for base request fields and event attributes.
pub type JsonMap = Map<String, Value>;

/// Default per-request byte ceiling when the caller does not supply one.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024 * 1024;

/// Request body fields managed by the builder itself.
const RESERVED_FIELDS: [&str; 3] = ["events", "threads", "client_time"];

/// Serialised length of an empty JSON array.
const EMPTY_ARRAY_LEN: usize = 2;

/// Bytes the closing suffix contributes beyond the threads array and the
/// client time digits.
const SUFFIX_FIXED_LEN: usize =
    b"],\"threads\":".len() + b",\"client_time\":".len() + b"}".len();

/// Errors raised for misuse of an [`AddEventsRequest`].
///
/// Network and server failures never surface here; they are reported as
/// [`SendStatus`](crate::session::SendStatus) values by the session.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The base fields were empty or used a reserved key.
    #[error("invalid request shape: {0}")]
    InvalidShape(String),
    /// The supplied position does not describe this request's history.
    #[error("position does not match this request's history")]
    InvalidPosition,
    /// The request was already finalised or closed.
    #[error("request is closed")]
    Closed,
    /// A field failed to serialise as JSON.
    #[error("failed to serialise request body: {0}")]
    Serialise(#[from] serde_json::Error),
}

/// A thread registration carried in the `threads` array of the request body.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDescriptor {
    pub id: String,
    pub name: String,
}

/// Opaque snapshot of a request's append history.
///
/// Obtained from [`AddEventsRequest::position`] and handed back to
/// [`AddEventsRequest::restore`] to discard everything appended after the
/// snapshot was taken.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    events_len: usize,
    events_added: usize,
    thread_count: usize,
}

/// An incrementally-built `/addEvents` request body with a byte ceiling.
///
/// The serialised body has the shape
/// `{<base fields>,"events":[...],"threads":[...],"client_time":N}`. Base
/// fields are serialised once at construction; events are appended to an open
/// array; the threads array and client time live in a closing suffix whose
/// size is tracked without re-serialisation, so the total size is known
/// exactly before every append.
pub struct AddEventsRequest {
    /// `{` + base fields + `,"events":[`.
    scaffold: Vec<u8>,
    /// Comma-joined serialised events, no surrounding brackets.
    events: Vec<u8>,
    threads: Vec<ThreadDescriptor>,
    /// Serialised length of the threads array, maintained incrementally.
    threads_len: usize,
    /// Epoch seconds; stamped at construction so appends budget a realistic
    /// digit count, revised via [`Self::set_client_time`].
    client_time: i64,
    max_size: usize,
    events_added: usize,
    timestamps: Arc<TimestampGenerator>,
    /// Finalised body; `Some` once [`Self::payload`] has run.
    payload: Option<Vec<u8>>,
    /// Length of the rendered closing suffix within the finalised body.
    suffix_len: usize,
    closed: bool,
}

impl AddEventsRequest {
    /// Create a request with its own timestamp generator.
    ///
    /// The client time starts at the construction wall clock and can be
    /// revised later with [`Self::set_client_time`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidShape`] if `base_fields` is empty or
    /// contains one of the builder-managed keys (`events`, `threads`,
    /// `client_time`).
    pub fn new(base_fields: JsonMap, max_size: usize) -> Result<Self, RequestError> {
        Self::with_timestamps(base_fields, max_size, Arc::new(TimestampGenerator::new()))
    }

    /// Create a request stamping events from a shared timestamp generator.
    pub fn with_timestamps(
        base_fields: JsonMap,
        max_size: usize,
        timestamps: Arc<TimestampGenerator>,
    ) -> Result<Self, RequestError> {
        if base_fields.is_empty() {
            return Err(RequestError::InvalidShape(
                "base fields must not be empty".to_string(),
            ));
        }
        for reserved in RESERVED_FIELDS {
            if base_fields.contains_key(reserved) {
                return Err(RequestError::InvalidShape(format!(
                    "field `{reserved}` is managed by the request"
                )));
            }
        }
        let mut scaffold = Vec::with_capacity(128);
        scaffold.push(b'{');
        for (index, (key, value)) in base_fields.iter().enumerate() {
            if index > 0 {
                scaffold.push(b',');
            }
            serde_json::to_writer(&mut scaffold, key)?;
            scaffold.push(b':');
            serde_json::to_writer(&mut scaffold, value)?;
        }
        scaffold.extend_from_slice(b",\"events\":[");
        Ok(Self {
            scaffold,
            events: Vec::new(),
            threads: Vec::new(),
            threads_len: EMPTY_ARRAY_LEN,
            client_time: epoch_seconds(),
            max_size,
            events_added: 0,
            timestamps,
            payload: None,
            suffix_len: 0,
            closed: false,
        })
    }

    /// Register a thread in the request's `threads` array.
    ///
    /// Returns `Ok(false)` without changing any state if the registration
    /// would push the serialised request past the byte ceiling.
    pub fn add_thread(&mut self, id: &str, name: &str) -> Result<bool, RequestError> {
        self.ensure_open()?;
        let descriptor = ThreadDescriptor {
            id: id.to_string(),
            name: name.to_string(),
        };
        let encoded = serde_json::to_vec(&descriptor)?;
        let mut delta = encoded.len();
        if !self.threads.is_empty() {
            delta += 1;
        }
        if self.current_size() + delta > self.max_size {
            return Ok(false);
        }
        self.threads.push(descriptor);
        self.threads_len += delta;
        Ok(true)
    }

    /// Append one event, stamping its `ts` field.
    ///
    /// The timestamp is `timestamp` when given, otherwise the next value from
    /// the request's generator, and is serialised as a decimal string. A `ts`
    /// key supplied by the caller is superseded; the caller's map itself is
    /// never modified.
    ///
    /// Returns `Ok(false)` without changing any observable state if the event
    /// would push the serialised request past the byte ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Closed`] once the request has been finalised
    /// or closed.
    pub fn add_event(
        &mut self,
        event: &JsonMap,
        timestamp: Option<i64>,
    ) -> Result<bool, RequestError> {
        self.ensure_open()?;
        let timestamp = timestamp.unwrap_or_else(|| self.timestamps.next());
        let start = self.events.len();
        if let Err(error) = self.write_event(event, timestamp) {
            self.events.truncate(start);
            return Err(error.into());
        }
        if self.current_size() > self.max_size {
            self.events.truncate(start);
            return Ok(false);
        }
        self.events_added += 1;
        Ok(true)
    }

    /// Snapshot the append history for a later [`Self::restore`].
    pub fn position(&self) -> Result<Position, RequestError> {
        self.ensure_open()?;
        Ok(Position {
            events_len: self.events.len(),
            events_added: self.events_added,
            thread_count: self.threads.len(),
        })
    }

    /// Discard every event and thread appended after `position` was taken.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPosition`] if `position` describes more
    /// history than this request currently holds, and
    /// [`RequestError::Closed`] once the request has been finalised or
    /// closed.
    pub fn restore(&mut self, position: &Position) -> Result<(), RequestError> {
        self.ensure_open()?;
        if position.events_len > self.events.len()
            || position.events_added > self.events_added
            || position.thread_count > self.threads.len()
        {
            return Err(RequestError::InvalidPosition);
        }
        self.events.truncate(position.events_len);
        self.events_added = position.events_added;
        self.threads.truncate(position.thread_count);
        self.threads_len = threads_array_len(&self.threads)?;
        Ok(())
    }

    /// Record the client send time carried in the body's `client_time` field.
    ///
    /// Before finalisation this only updates the size accounting. After
    /// finalisation the cached body is revised in place by rewriting the
    /// closing suffix; the events themselves are never re-serialised.
    ///
    /// Returns `Ok(false)` and keeps the previous stamp when the new value's
    /// rendering would push a request that currently fits past the byte
    /// ceiling.
    pub fn set_client_time(&mut self, timestamp: i64) -> Result<bool, RequestError> {
        if self.closed {
            return Err(RequestError::Closed);
        }
        let current = self.current_size();
        let revised = current - decimal_len(self.client_time) + decimal_len(timestamp);
        if revised > self.max_size && current <= self.max_size {
            return Ok(false);
        }
        self.client_time = timestamp;
        if let Some(body) = self.payload.as_mut() {
            let suffix_start = body.len() - self.suffix_len;
            body.truncate(suffix_start);
            self.suffix_len = write_suffix(body, &self.threads, timestamp)?;
        }
        Ok(true)
    }

    /// Finalise the request and return the complete serialised body.
    ///
    /// The first call closes the events array and appends the threads array
    /// and client time; further calls return the same bytes. After
    /// finalisation the request accepts no more appends.
    pub fn payload(&mut self) -> Result<&[u8], RequestError> {
        if self.closed {
            return Err(RequestError::Closed);
        }
        if self.payload.is_none() {
            let mut body = std::mem::take(&mut self.scaffold);
            body.append(&mut self.events);
            self.suffix_len = write_suffix(&mut body, &self.threads, self.client_time)?;
            self.payload = Some(body);
        }
        Ok(self.payload.as_deref().unwrap_or_default())
    }

    /// Exact serialised size of the request body as it stands.
    pub fn current_size(&self) -> usize {
        match &self.payload {
            Some(body) => body.len(),
            None => self.scaffold.len() + self.events.len() + self.suffix_overhead(),
        }
    }

    /// Number of events committed to the request.
    pub fn total_events(&self) -> usize {
        self.events_added
    }

    /// Release the request's buffers; every later operation fails
    /// [`RequestError::Closed`].
    pub fn close(&mut self) {
        self.closed = true;
        self.scaffold = Vec::new();
        self.events = Vec::new();
        self.threads = Vec::new();
        self.threads_len = EMPTY_ARRAY_LEN;
        self.payload = None;
    }

    fn ensure_open(&self) -> Result<(), RequestError> {
        if self.closed || self.payload.is_some() {
            return Err(RequestError::Closed);
        }
        Ok(())
    }

    /// Bytes the closing suffix will occupy given the current threads array
    /// and client time.
    fn suffix_overhead(&self) -> usize {
        SUFFIX_FIXED_LEN + self.threads_len + decimal_len(self.client_time)
    }

    fn write_event(&mut self, event: &JsonMap, timestamp: i64) -> Result<(), serde_json::Error> {
        if self.events_added > 0 {
            self.events.push(b',');
        }
        self.events.push(b'{');
        let mut first = true;
        for (key, value) in event {
            if key == "ts" {
                continue;
            }
            if !first {
                self.events.push(b',');
            }
            first = false;
            serde_json::to_writer(&mut self.events, key)?;
            self.events.push(b':');
            serde_json::to_writer(&mut self.events, value)?;
        }
        if !first {
            self.events.push(b',');
        }
        self.events.extend_from_slice(b"\"ts\":\"");
        self.events
            .extend_from_slice(timestamp.to_string().as_bytes());
        self.events.extend_from_slice(b"\"}");
        Ok(())
    }
}

/// Append `],"threads":<threads>,"client_time":<time>}` and return its
/// length.
fn write_suffix(
    body: &mut Vec<u8>,
    threads: &[ThreadDescriptor],
    client_time: i64,
) -> Result<usize, serde_json::Error> {
    let start = body.len();
    body.extend_from_slice(b"],\"threads\":");
    serde_json::to_writer(&mut *body, threads)?;
    body.extend_from_slice(b",\"client_time\":");
    body.extend_from_slice(client_time.to_string().as_bytes());
    body.push(b'}');
    Ok(body.len() - start)
}

/// Serialised length of `threads` as a JSON array.
fn threads_array_len(threads: &[ThreadDescriptor]) -> Result<usize, serde_json::Error> {
    let mut len = EMPTY_ARRAY_LEN;
    for (index, thread) in threads.iter().enumerate() {
        if index > 0 {
            len += 1;
        }
        len += serde_json::to_vec(thread)?.len();
    }
    Ok(len)
}

/// Number of characters in the decimal rendering of `value`.
fn decimal_len(value: i64) -> usize {
    let mut len = usize::from(value < 0);
    let mut magnitude = value.unsigned_abs();
    loop {
        len += 1;
        magnitude /= 10;
        if magnitude == 0 {
            return len;
        }
    }
}

/// Seconds since the UNIX epoch, 0 if the system clock is before it.
fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

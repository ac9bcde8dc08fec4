//! Records flowing through the stage and the handles that complete them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// One usage event. An open mapping of field name to value, mutated in place
/// by the stage and otherwise opaque to it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Read a field as a string, rendering numbers the way they are written.
    pub fn get_str(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.to_owned()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_owned(), value.into());
    }

    /// Copy every field of `fields` onto the record, overwriting existing values.
    pub fn merge_fields(&mut self, fields: &Map<String, Value>) {
        for (field, value) in fields {
            self.0.insert(field.clone(), value.clone());
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Record(fields)
    }
}

/// Why a record was dropped from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// A portal-to-portal redirection duplicating another usage event.
    Redirection,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::Redirection => write!(f, "portal to portal redirection"),
        }
    }
}

/// Outcome of the duplicate/redirection check run after fields were merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Discard(DiscardReason),
}

/// What a record's continuation is invoked with.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The record continues downstream, enriched or not.
    Keep(Record),
    /// The record must be dropped.
    Discard { record: Record, reason: DiscardReason },
    /// The stage stopped on a fatal error before the record was resolved.
    Aborted(Record),
}

impl Completion {
    pub fn from_verdict(record: Record, verdict: Verdict) -> Self {
        match verdict {
            Verdict::Keep => Completion::Keep(record),
            Verdict::Discard(reason) => Completion::Discard { record, reason },
        }
    }

    pub fn record(&self) -> &Record {
        match self {
            Completion::Keep(record)
            | Completion::Discard { record, .. }
            | Completion::Aborted(record) => record,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Completion::Keep(_))
    }
}

/// How the stream ended, handed to the end-of-input continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Aborted,
}

/// A one-shot completion handle. Consuming `self` on completion makes a second
/// invocation impossible.
pub struct Continuation<T> {
    callback: Box<dyn FnOnce(T) + Send>,
}

impl<T: Send + 'static> Continuation<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A continuation delivering its value on a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let continuation = Self::new(move |value| {
            if tx.send(value).is_err() {
                tracing::debug!("completion dropped, nobody waits for it anymore");
            }
        });
        (continuation, rx)
    }

    pub fn complete(self, value: T) {
        (self.callback)(value)
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

/// A record waiting in the stage together with its continuation.
#[derive(Debug)]
pub struct BufferEntry {
    pub record: Record,
    pub continuation: Continuation<Completion>,
}

impl BufferEntry {
    pub fn new(record: Record, continuation: Continuation<Completion>) -> Self {
        Self {
            record,
            continuation,
        }
    }

    pub fn keep(self) {
        self.continuation.complete(Completion::Keep(self.record))
    }

    pub fn finish(self, verdict: Verdict) {
        self.continuation
            .complete(Completion::from_verdict(self.record, verdict))
    }

    pub fn abort(self) {
        self.continuation.complete(Completion::Aborted(self.record))
    }
}

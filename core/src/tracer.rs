//! Diagnostic ring of interpreter events. Off by default; enabled by the
//! `verbose` option. The tracer is owned by the interpreter instance (no
//! global state) and is cleared by `reset`.

use crate::consts::TRACE_CAPACITY;
use std::collections::VecDeque;

/// What an event records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceKind {
    /// Entered a node or function
    Enter,
    /// Left a node or function
    Exit,
    /// Emitted a command
    Emit,
}

/// One recorded event.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceEvent {
    pub kind: TraceKind,
    /// Short human-readable detail, e.g. a node tag or command type
    pub detail: String,
    /// Interpreter clock at the time of the event
    pub ts: u32,
}

/// Bounded event buffer; the oldest events are dropped once
/// [TRACE_CAPACITY] is reached.
#[derive(Debug)]
pub struct ExecutionTracer {
    enabled: bool,
    events: VecDeque<TraceEvent>,
}

impl ExecutionTracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(
        &mut self,
        kind: TraceKind,
        detail: impl Into<String>,
        ts: u32,
    ) {
        if !self.enabled {
            return;
        }
        if self.events.len() == TRACE_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(TraceEvent {
            kind,
            detail: detail.into(),
            ts,
        });
    }

    pub fn enter(&mut self, detail: impl Into<String>, ts: u32) {
        self.record(TraceKind::Enter, detail, ts);
    }

    pub fn exit(&mut self, detail: impl Into<String>, ts: u32) {
        self.record(TraceKind::Exit, detail, ts);
    }

    pub fn emit(&mut self, detail: impl Into<String>, ts: u32) {
        self.record(TraceKind::Emit, detail, ts);
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

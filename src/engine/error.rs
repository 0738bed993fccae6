use crate::model::{Conflict, EventId, Ms, ResourceId};
use crate::time::format_ms;

#[derive(Debug)]
pub enum EngineError {
    EventNotFound(EventId),
    ResourceNotFound(ResourceId),
    /// `start >= end` on an event or a reporting window.
    InvalidTimeRange {
        start: Ms,
        end: Ms,
    },
    /// A write was refused because the window overlaps existing allocations.
    Conflict(Vec<Conflict>),
    /// A resource changed underneath a write between lookup and lock; retry the operation.
    ConcurrencyConflict(ResourceId),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EventNotFound(id) => write!(f, "event not found: {id}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::InvalidTimeRange { start, end } => write!(
                f,
                "start must be earlier than end: [{}, {})",
                format_ms(*start),
                format_ms(*end)
            ),
            EngineError::Conflict(conflicts) => {
                write!(f, "resource conflict detected:")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { "; " };
                    write!(
                        f,
                        "{sep}'{}' [{}, {}) on '{}'",
                        c.event.title,
                        format_ms(c.event.span.start),
                        format_ms(c.event.span.end),
                        c.resource.name
                    )?;
                }
                Ok(())
            }
            EngineError::ConcurrencyConflict(id) => {
                write!(f, "resource {id} changed concurrently, retry")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

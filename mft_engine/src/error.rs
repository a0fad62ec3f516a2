/// error.rs — Engine error taxonomy
///
/// Distinguishes failures the event loop must merely log and continue past
/// (transient transport, stale quotes) from the ones that should refuse to
/// start at all (fatal misconfiguration). Pure pipeline code (bar
/// aggregation, feature computation, signal/position logic) is
/// deterministic and represents "invalid" states in-band — a sentinel
/// `ValueArea { is_valid: false, .. }`, a `None` — rather than through this
/// type; `EngineError` is reserved for the boundary components (transport,
/// execution, config) that actually talk to the outside world.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("stale quote: age {age_ms}ms exceeds {max_ms}ms")]
    StaleQuote { age_ms: i64, max_ms: i64 },

    #[error("invalid value area: {0}")]
    InvalidVa(String),

    #[error("execution rejected: {0}")]
    ExecutionReject(String),

    #[error("risk gate: {0}")]
    RiskGate(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

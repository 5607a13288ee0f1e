//! Module-boundary error types. Pure functions never return `Result` (they return
//! numeric defaults per the metrics error policy); these enums sit at the seams
//! callers actually need to match on.

use thiserror::Error;

/// Errors surfaced by a `MarketDataSource` adapter call.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{exchange}: circuit open for {symbol_or_op}")]
    CircuitOpen {
        exchange: String,
        symbol_or_op: String,
    },

    #[error("{exchange}/{method} failed for {symbol}: {source}")]
    Transient {
        exchange: String,
        method: &'static str,
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{exchange}/{method} permanently failed for {symbol}: {reason}")]
    Permanent {
        exchange: String,
        method: &'static str,
        symbol: String,
        reason: String,
    },

    #[error("{exchange}/{method} timed out after {timeout_sec}s for {symbol}")]
    Timeout {
        exchange: String,
        method: &'static str,
        symbol: String,
        timeout_sec: u64,
    },
}

/// Failure to compile a rule expression (spec §4.8, §6.5). Disables the rule at
/// load time; never raised during evaluation.
#[derive(Debug, Error)]
pub enum RuleCompileError {
    #[error("unexpected character '{0}' at byte offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal starting at byte offset {0}")]
    UnterminatedString(usize),

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEof,

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("disallowed construct: {0}")]
    DisallowedConstruct(&'static str),

    #[error("trailing input after a complete expression: {0:?}")]
    TrailingInput(String),
}

/// Configuration errors are fatal at startup (spec §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("unknown scoring profile '{0}'; available: {1}")]
    UnknownProfile(String, String),
}

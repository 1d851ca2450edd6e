//! Structured error handling for the Trawl core engine.
//!
//! Every public API returns [`TrawlResult`]. Errors carry enough located
//! context (rule name, pattern number, slot) to point at the join or image
//! section that produced them, and never abort the host process.

use thiserror::Error;

/// Error type for core engine operations.
#[derive(Error, Debug, Clone)]
pub enum TrawlError {
    /// Rule compilation and installation errors.
    #[error("rule error: {message}")]
    Rule { message: String, rule_name: Option<String> },

    /// Join test or hash expression evaluation errors, located to the
    /// join network position that raised them.
    #[error("evaluation error in rule '{rule_name}', pattern {pattern}: {message}")]
    Evaluation { message: String, rule_name: String, pattern: usize, slot: Option<String> },

    /// Working-memory operation errors.
    #[error("working memory error: {message}")]
    WorkingMemory { message: String, entity: Option<u64> },

    /// Binary image load/save errors. The engine is left in its pre-load
    /// state when a load fails.
    #[error("binary image error: {message}")]
    Image { message: String, section: Option<String> },

    /// Operations rejected because of engine state, such as `bsave` while
    /// a loaded image is active or `clear` with constructs in use.
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// Resource exhaustion that survived the retry protocol.
    #[error("resource error: {message}")]
    Resource { message: String, requested: Option<usize> },
}

impl TrawlError {
    pub fn rule(message: impl Into<String>) -> Self {
        TrawlError::Rule { message: message.into(), rule_name: None }
    }

    pub fn rule_named(message: impl Into<String>, name: impl Into<String>) -> Self {
        TrawlError::Rule { message: message.into(), rule_name: Some(name.into()) }
    }

    pub fn working_memory(message: impl Into<String>) -> Self {
        TrawlError::WorkingMemory { message: message.into(), entity: None }
    }

    pub fn image(message: impl Into<String>) -> Self {
        TrawlError::Image { message: message.into(), section: None }
    }

    pub fn image_section(message: impl Into<String>, section: impl Into<String>) -> Self {
        TrawlError::Image { message: message.into(), section: Some(section.into()) }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        TrawlError::IllegalState { message: message.into() }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            TrawlError::Rule { .. } => "rule",
            TrawlError::Evaluation { .. } => "evaluation",
            TrawlError::WorkingMemory { .. } => "working_memory",
            TrawlError::Image { .. } => "image",
            TrawlError::IllegalState { .. } => "illegal_state",
            TrawlError::Resource { .. } => "resource",
        }
    }

    /// Whether the caller can reasonably retry after fixing inputs.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrawlError::Rule { .. } => true,
            TrawlError::Evaluation { .. } => true,
            TrawlError::WorkingMemory { .. } => false,
            TrawlError::Image { .. } => true,
            TrawlError::IllegalState { .. } => true,
            TrawlError::Resource { .. } => false,
        }
    }
}

/// Result alias used by all public core APIs.
pub type TrawlResult<T> = Result<T, TrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(TrawlError::rule("x").category(), "rule");
        assert_eq!(TrawlError::image("x").category(), "image");
        assert!(TrawlError::rule("x").is_recoverable());
        assert!(!TrawlError::working_memory("x").is_recoverable());
    }

    #[test]
    fn test_located_evaluation_display() {
        let err = TrawlError::Evaluation {
            message: "bad comparison".into(),
            rule_name: "r1".into(),
            pattern: 2,
            slot: Some("k".into()),
        };
        let text = err.to_string();
        assert!(text.contains("r1"));
        assert!(text.contains("pattern 2"));
    }
}

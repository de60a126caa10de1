//! Unified error handling for the resolution pipeline.
//!
//! Every failure in pavise is a [`ResolveError`]: a typed [`ErrorKind`], a
//! stack of human context frames, and an optional chained cause. Causes are
//! always preserved, never swallowed. Display renders the chain outermost
//! first: `frame: frame: what went wrong: cause`.

use std::fmt;

use miette::Diagnostic;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// The single error type for configuration resolution.
#[derive(Debug)]
pub struct ResolveError {
    kind: ErrorKind,
    /// Context frames, innermost first. Pushed as errors propagate upward.
    context: Vec<String>,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

/// What actually went wrong, with enough identity to locate the offending
/// definition without re-running at higher verbosity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Malformed structure: inconsistent sub-keys, bad override paths,
    /// out-of-range list indexes, unparseable template text.
    #[error("{message}")]
    Structural { message: String },

    /// A variable reference that doesn't parse or doesn't exist.
    #[error("invalid reference '{key}': {message}")]
    Reference { key: String, message: String },

    /// A deferred value was read where a concrete one was required.
    #[error("deferred variable '{key}' read where a concrete value is required")]
    DeferredAccess { key: String },

    /// A reference or inheritance loop. The chain names every participant.
    #[error("reference loop: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// The scheduler plugin was missing, unavailable, or failed internally.
    #[error("scheduler '{scheduler}': {message}")]
    SchedulerResolution { scheduler: String, message: String },

    /// The config declares a compatible version range this version of
    /// pavise doesn't satisfy.
    #[error("config requires compatible version '{required}', but this is version '{current}'")]
    VersionIncompatible { required: String, current: String },
}

impl ErrorKind {
    /// Stable category name, used as the diagnostic code suffix.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorKind::Structural { .. } => "structural",
            ErrorKind::Reference { .. } => "reference",
            ErrorKind::DeferredAccess { .. } => "deferred",
            ErrorKind::Cycle { .. } => "cycle",
            ErrorKind::SchedulerResolution { .. } => "scheduler",
            ErrorKind::VersionIncompatible { .. } => "version",
        }
    }
}

impl ResolveError {
    pub fn new(kind: ErrorKind) -> Self {
        ResolveError {
            kind,
            context: Vec::new(),
            cause: None,
        }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural {
            message: message.into(),
        })
    }

    pub fn reference(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reference {
            key: key.into(),
            message: message.into(),
        })
    }

    pub fn deferred(key: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeferredAccess { key: key.into() })
    }

    pub fn cycle(chain: Vec<String>) -> Self {
        Self::new(ErrorKind::Cycle { chain })
    }

    pub fn scheduler(scheduler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchedulerResolution {
            scheduler: scheduler.into(),
            message: message.into(),
        })
    }

    pub fn version(required: impl Into<String>, current: impl Into<String>) -> Self {
        Self::new(ErrorKind::VersionIncompatible {
            required: required.into(),
            current: current.into(),
        })
    }

    /// Push a context frame ("test 'foo' in suite 'bar'"). Frames stack as
    /// the error propagates, so push innermost first.
    pub fn context(mut self, frame: impl Into<String>) -> Self {
        self.context.push(frame.into());
        self
    }

    /// Attach the error that triggered this one.
    pub fn caused_by(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// True when this is a deferred-access failure. Several resolution
    /// phases treat those as "not yet" rather than fatal.
    pub fn is_deferred(&self) -> bool {
        matches!(self.kind, ErrorKind::DeferredAccess { .. })
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.context.iter().rev() {
            write!(f, "{frame}: ")?;
        }
        write!(f, "{}", self.kind)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl Diagnostic for ResolveError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(format!("pavise::{}", self.kind.category())))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let help: &str = match &self.kind {
            ErrorKind::Structural { .. } => {
                "Check the shape of the offending config section or variable."
            }
            ErrorKind::Reference { .. } => {
                "Variable keys look like 'scope.name.index.subkey'; \
                 scope, index and subkey are optional."
            }
            ErrorKind::DeferredAccess { .. } => {
                "Deferred values only become concrete once the test reaches \
                 its allocation; this context requires a concrete value."
            }
            ErrorKind::Cycle { .. } => {
                "Break the loop by removing one of the listed references."
            }
            ErrorKind::SchedulerResolution { .. } => {
                "Make sure the named scheduler plugin is registered and \
                 available on this system."
            }
            ErrorKind::VersionIncompatible { .. } => {
                "Adjust 'compatible_versions' or upgrade to a matching version."
            }
        };
        Some(Box::new(help))
    }
}

/// Result adapter for pushing context frames without unwrapping.
pub trait ResultExt<T> {
    fn frame(self, frame: impl Into<String>) -> Result<T>;
    fn frame_with(self, frame: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn frame(self, frame: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(frame))
    }

    fn frame_with(self, frame: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| e.context(frame()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_chains_context_outermost_first() {
        let err = ResolveError::reference("foo.bar", "no such variable")
            .context("test 'mytest'")
            .context("suite 'mysuite'");

        assert_eq!(
            err.to_string(),
            "suite 'mysuite': test 'mytest': \
             invalid reference 'foo.bar': no such variable"
        );
    }

    #[test]
    fn cause_is_preserved() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ResolveError::structural("could not read variable file").caused_by(io_err);

        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(ResolveError::deferred("sys.x").kind().category(), "deferred");
        assert_eq!(
            ResolveError::cycle(vec!["a".into(), "b".into(), "a".into()])
                .kind()
                .category(),
            "cycle"
        );
    }
}

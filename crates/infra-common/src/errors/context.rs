use crate::errors::types::Error;
use std::fmt;

/// Context information for an error
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component where the error occurred
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional context information
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        ErrorContext {
            component: component.into(),
            operation: operation.into(),
            details: None,
        }
    }

    /// Add details to the context
    pub fn with_details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in component '{}' during operation '{}'", self.component, self.operation)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    /// Add context to the error side of a result
    fn context(self, ctx: ErrorContext) -> Result<T, Error>;

    /// Add simple context with component and operation
    fn with_context<S: Into<String>, U: Into<String>>(self, component: S, operation: U) -> Result<T, Error>;
}

impl Error {
    /// Wrap this error's message with the given context.
    ///
    /// The variant is kept where it carries a message; transparent variants
    /// such as `Io` collapse into `Custom`.
    pub fn with_context_info(self, ctx: &ErrorContext) -> Error {
        match self {
            Error::Config(msg) => Error::Config(format!("{} [{}]", msg, ctx)),
            Error::Logging(msg) => Error::Logging(format!("{} [{}]", msg, ctx)),
            Error::Task(msg) => Error::Task(format!("{} [{}]", msg, ctx)),
            Error::Timeout(msg) => Error::Timeout(format!("{} [{}]", msg, ctx)),
            Error::Validation(msg) => Error::Validation(format!("{} [{}]", msg, ctx)),
            Error::Internal(msg) => Error::Internal(format!("{} [{}]", msg, ctx)),
            other => Error::Custom(format!("{} [{}]", other, ctx)),
        }
    }
}

impl<T> ErrorExt<T> for Result<T, Error> {
    fn context(self, ctx: ErrorContext) -> Result<T, Error> {
        self.map_err(|e| e.with_context_info(&ctx))
    }

    fn with_context<S: Into<String>, U: Into<String>>(self, component: S, operation: U) -> Result<T, Error> {
        self.context(ErrorContext::new(component, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let ctx = ErrorContext::new("relay", "append").with_details("signals/bob");
        assert_eq!(
            ctx.to_string(),
            "in component 'relay' during operation 'append' (signals/bob)"
        );
    }

    #[test]
    fn test_context_keeps_variant() {
        let result: Result<(), Error> = Err(Error::Config("missing field".to_string()));
        let err = result.with_context("cli", "load_config").unwrap_err();
        match err {
            Error::Config(msg) => {
                assert!(msg.contains("missing field"));
                assert!(msg.contains("'cli'"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_ok_passes_through() {
        let result: Result<u32, Error> = Ok(7);
        assert_eq!(result.with_context("cli", "noop").unwrap(), 7);
    }
}

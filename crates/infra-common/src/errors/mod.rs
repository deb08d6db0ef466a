/*!
Error Handling

Standardized error types for the peerlink stack:

- Common error type and result alias
- Error context utilities
*/

pub mod types;
mod context;

pub use types::{Error, Result};
pub use context::{ErrorContext, ErrorExt};

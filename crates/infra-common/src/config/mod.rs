/*!
Configuration System

Layered configuration loading for the peerlink stack:

1. Defaults taken from the target type's `Default` implementation
2. An optional configuration file (format inferred from the extension)
3. Environment variables under a prefix, `__` separating nested keys
*/

mod loader;

pub use loader::ConfigLoader;

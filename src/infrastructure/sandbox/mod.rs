//! Sandbox provider implementations.

pub mod http_provider;
pub mod mock;

pub use http_provider::HttpSandboxProvider;
pub use mock::MockSandboxProvider;

//! HTTP clients for the worker ↔ orchestrator boundary.

pub mod callback_client;

pub use callback_client::CallbackClient;

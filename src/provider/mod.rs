//! Provider plugins and dispatch.
//!
//! This module provides:
//! - [`Provider`], the plugin trait
//! - [`ProviderDispatcher`] routing operations by kind with a per-call timeout
//! - [`HttpProvider`] for remote providers and [`EchoProvider`] for dry runs

mod dispatcher;
mod echo;
mod http;
mod plugin;

pub use dispatcher::{
    DEFAULT_CALL_TIMEOUT_SECS, DispatchOutcome, DispatchRequest, ProviderDispatcher,
    ProviderRegistry,
};
pub use echo::EchoProvider;
pub use http::HttpProvider;
pub use plugin::{Created, Provider, UpdateOutcome};

#[cfg(test)]
pub use plugin::MockProvider;

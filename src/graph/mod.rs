//! Resource graph: values, declarations, registry and dependency order.
//!
//! This module provides:
//! - [`Value`] and [`ValueGraph`] for properties that reference other
//!   resources' outputs
//! - [`ResourceSpec`] and [`ResourceHandle`] for declarations
//! - [`ResourceRegistry`] holding specs in declaration order
//! - [`DependencyResolver`] producing a topological order and tiers

mod registry;
mod resolver;
mod resource;
mod value;

pub use registry::ResourceRegistry;
pub use resolver::{DependencyResolver, ResolvedOrder};
pub use resource::{ResourceHandle, ResourceSpec, provider_prefix};
pub use value::{ID_FIELD, OutputRef, Properties, VARIABLE_NAMESPACE, Value, ValueGraph};

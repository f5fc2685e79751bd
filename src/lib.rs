// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terrace
//!
//! A declarative resource-graph provisioner.
//!
//! ## Overview
//!
//! A stack declares named resources whose inputs may reference other
//! resources' outputs. Terrace infers the dependency graph from those
//! references, then:
//!
//! - Plans the creates, updates and deletes needed to match the declaration
//! - Applies them through provider plugins with bounded parallelism
//! - Isolates failures so unrelated branches of the graph keep going
//! - Records resource identities and outputs in a locked state store
//!
//! ## Architecture
//!
//! 1. **Value graph**: inputs that are literals or references to outputs
//!    not yet known, resolved as resources complete
//! 2. **Registry and resolver**: unique names, reference checks, cycle
//!    detection and a topological order
//! 3. **Provider dispatcher**: routes each operation to the provider
//!    registered for the resource kind
//! 4. **Planner and engine**: diff against state, then execute in
//!    dependency order
//!
//! ## Modules
//!
//! - [`graph`]: Value graph, resource registry and dependency resolver
//! - [`provider`]: Provider trait, dispatcher and built-in providers
//! - [`planner`]: Diff computation, plans and the parallel executor
//! - [`engine`]: Plan, apply and destroy runs
//! - [`config`]: Stack file parsing and validation
//! - [`state`]: State storage backends (local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: demo
//!
//! providers:
//!   - name: net
//!     type: echo
//!
//! resources:
//!   - name: net1
//!     kind: net:network
//!     inputs:
//!       cidr: 10.0.0.0/16
//!   - name: vm1
//!     kind: net:vm
//!     inputs:
//!       networkId: ${net1.id}
//!
//! outputs:
//!   vmId: ${vm1.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, InputsHasher, StackConfig};
pub use engine::{Engine, RunMode, RunResult, RunStatus};
pub use error::{Result, TerraceError};
pub use graph::{
    DependencyResolver, OutputRef, ResourceHandle, ResourceRegistry, ResourceSpec, Value,
    ValueGraph,
};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{EchoProvider, HttpProvider, Provider, ProviderDispatcher, ProviderRegistry};
pub use state::{LocalStateStore, S3StateStore, StackState, StateStore};

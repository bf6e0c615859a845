// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![warn(warnings)]                    // Surface every warning
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
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

//! # converge
//!
//! A declarative, idempotent reconciliation engine for graphs of
//! infrastructure resources.
//!
//! ## Overview
//!
//! You declare the resources you want in a YAML file; converge works out
//! what has to change and makes it so:
//!
//! - Resources reference each other's outputs, which forms a dependency graph
//! - Each run compares the declaration with the last-applied state
//! - Changes are scheduled so producers are created before consumers and
//!   consumers are destroyed before producers
//! - Independent changes run in parallel, up to a configured limit
//! - A failure only blocks the resources that depend on it
//!
//! ## Architecture
//!
//! 1. **Declaration**: parsed and validated from `converge.yaml`
//! 2. **Graph**: references are flattened into edges and checked for cycles
//! 3. **Diff**: declared attributes are compared with recorded state
//! 4. **Plan**: changes are expanded into ordered steps
//! 5. **Apply**: steps are executed against providers and persisted
//!
//! ## Modules
//!
//! - [`model`]: Addresses, values and schemas
//! - [`config`]: Declaration parsing and validation
//! - [`graph`]: Dependency graph and cycle detection
//! - [`planner`]: Diff, scheduling and apply execution
//! - [`provider`]: Provider plugin interface and built-in providers
//! - [`state`]: State storage backends (local, memory)
//! - [`reconciler`]: Orchestration of a full run
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: dev
//!
//! kinds:
//!   bucket:
//!     attributes:
//!       name: { type: string, required: true, immutable: true }
//!     outputs: [arn]
//!   policy:
//!     attributes:
//!       bucket: { type: string, required: true }
//!
//! resources:
//!   - kind: bucket
//!     name: assets
//!     attributes:
//!       name: web-assets
//!   - kind: policy
//!     name: read
//!     attributes:
//!       bucket: "${bucket.assets.arn}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeclarationFile};
pub use error::{ConvergeError, Result};
pub use graph::DependencyGraph;
pub use model::{Address, Reference, Resource, ResourceSchema, Value};
pub use planner::{
    ApplyExecutor, ApplyResult, ChangeSet, DiffEngine, ExecutionPlan, ResourceOutcome, Scheduler,
};
pub use provider::{LocalProvider, MemoryProvider, Provider, ProviderRegistry};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, StateRecord, StateStore};

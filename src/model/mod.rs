//! Resource model for declared infrastructure.
//!
//! This module turns raw declarations into typed resources:
//! - Addresses (`kind.name`) identifying every resource
//! - Attribute values with an explicit reference variant
//! - Per-kind schemas describing required and immutable attributes

mod address;
mod resource;
mod schema;
mod value;

pub use address::{is_valid_segment, Address, Reference};
pub use resource::{Lifecycle, Resource};
pub use schema::{AttributeSchema, AttributeType, ResourceSchema, ID_OUTPUT};
pub use value::{AttrMap, PlannedValue, Value, ValueParseError};

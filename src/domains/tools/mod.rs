//! Tools domain module.
//!
//! Everything between a downstream server's raw tool advertisement and a
//! routed call:
//!
//! - `schema.rs` - JSON Schema to [`ParamSchema`] translation and validation
//! - `discovery.rs` - per-server tool listing
//! - `descriptor.rs` - [`ToolDescriptor`], one invocable downstream tool
//! - `router.rs` - [`CallRouter`], dispatch against the live registry
//! - `error.rs` - tool and schema error types

mod descriptor;
mod discovery;
mod error;
mod router;
mod schema;

pub use descriptor::{QUALIFIER, ToolDescriptor, qualified_name};
pub use discovery::{describe, discover_tools};
pub use error::{CallFailure, Fault, SchemaError, ToolError};
pub use router::CallRouter;
pub use schema::{ArraySchema, NumberSchema, ObjectSchema, ParamSchema, Property, StringSchema};

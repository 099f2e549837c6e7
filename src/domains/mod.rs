//! Domains module containing the gateway's business logic, organized by
//! bounded contexts, leaf first.

pub mod channel;
pub mod connections;
pub mod directory;
pub mod registry;
pub mod tools;

//! Shared types for the Helm agent runtime: the error taxonomy, the
//! provider/model identity, the provider-agnostic conversation model,
//! streaming event types, queue lanes, and request options.

pub mod error;
pub mod json;
pub mod message;
pub mod model;
pub mod options;
pub mod queue;
pub mod stream;

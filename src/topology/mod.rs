//! Declare the exchanges, queues and bindings your publishers and consumers rely on.
//!
//! A [`TopologyConfig`] can be deserialized from your configuration and handed to
//! [`Topologer::build_topology`], or single objects can be managed one by one.
mod configuration;
mod topologer;

pub use configuration::{
    field_table, ArgumentValue, Arguments, BindingDescriptor, ExchangeDescriptor, ExchangeKind,
    QueueDescriptor, TopologyConfig,
};
pub use topologer::{Topologer, TopologyError};

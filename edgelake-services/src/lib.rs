pub mod cache;
pub mod common;
pub mod context;
pub mod function;
pub mod memory;
pub mod messaging;
pub mod node;
pub mod path;
pub mod serviceable;
pub mod website;

#[cfg(test)]
mod testing;

pub use cache::{Cache, GetOptions};
pub use context::{Collaborators, NodeContext};
pub use node::Node;
pub use serviceable::{Handled, Outcome, Serviceable};

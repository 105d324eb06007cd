//! Request fingerprints and match scoring scale.
//!
//! A [`MatchDefinition`] is what the transport layer hands over for every
//! request; serviceables score themselves against it with a [`MatchIndex`].
mod definition;
mod index;

pub use definition::{
    extract_host, HttpTarget, MatchDefinition, PubSubTarget, Target, Transport,
};
pub use index::MatchIndex;

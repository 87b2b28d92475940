//! Offer/answer negotiation and candidate relay

pub mod candidates;
pub mod engine;

pub use candidates::{CandidateRelay, DrainReport};
pub use engine::NegotiationEngine;

//! Data models for a WHIP publish session
//!
//! Session states, peer events, trickle candidate bookkeeping and the local
//! media tracks handed to the peer connection.

pub mod candidates;
pub mod event;
pub mod state;
pub mod tracks;

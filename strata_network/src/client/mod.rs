//! Inlet-side networking.

pub mod tcp;
pub mod udp;

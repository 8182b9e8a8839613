//! The networking modules in `Photon` move raw datagrams from the socket,
//! through the installed packet handler chain, to the consumer-facing frame
//! queue or push hook.

pub mod support;
pub mod ring;
pub mod handler;
pub mod delivery;
pub mod srtcp;
pub mod rtp;
pub mod receiver;
pub mod processor;
pub mod session;

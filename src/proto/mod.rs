//! The BK72xx serial ISP wire protocol: packet definitions and the
//! resync/retry engine that drives them over a transport.

pub mod engine;
pub mod packet;

pub use engine::{Engine, Transport};

//! Tor control-port session handling
//!
//! Drives one session of the control protocol. Tor itself is treated
//! as a black box behind the line-oriented 250/650 wire format.

pub mod control;

pub use control::{
    AddOnionConfig, AddOnionReply, ControlError, OnionKey, SessionState, TorController,
};

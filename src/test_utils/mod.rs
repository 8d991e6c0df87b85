//! the test_utils folder here will share fixtures between the unit tests of
//! the watch stream, the multiplexer and the subscription manager
mod common;
mod recording_handler;

pub use common::*;
pub use recording_handler::*;

//! Utilities for testing code that talks through a messenger. They are used for the messenger's
//!  own tests, and they are exported for application testing.

pub mod dispatcher;
pub mod proxy;
pub mod raw_peer;

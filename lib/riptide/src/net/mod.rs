//! Networking: packet envelope, buffered streams and the event loop that
//! drives them.

pub mod buffer;
pub mod endpoint;
pub mod pkg;
pub mod shared;
pub mod stream;

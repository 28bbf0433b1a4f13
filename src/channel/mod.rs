//! Push-channel client: connection lifecycle and frame dispatch.

pub mod connection;
pub mod dispatcher;

pub use connection::{ChannelCloser, ChannelConnection, ChannelHandle, ChannelNotice, ChannelState};
pub use dispatcher::{Dispatch, EventDispatcher};

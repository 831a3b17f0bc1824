//! Packet parsing and mutation
//!
//! [`PacketView`] wraps one captured IP datagram; [`StreamIdentity`] is
//! the direction-agnostic flow key everything else hangs off.

mod stream_id;
mod view;

pub use stream_id::{Endpoint, StreamIdentity, TransportProto};
pub use view::{Direction, PacketView};

//! Point-to-point and collective primitives the transport is built on.
//!
//! Shaped after non-blocking message passing: sends and receives are posted, then tested
//! for completion. Only `barrier` and `all_reduce_sum` block.

use std::fmt;
use std::sync::Arc;

pub type Rank = usize;

/// The two logical message streams between ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Small fixed-size control and status frames.
    Status,
    /// Variable-size curve batches.
    Curves,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Status, Channel::Curves];

    pub fn index(self) -> usize {
        match self {
            Channel::Status => 0,
            Channel::Curves => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Status => "status",
            Channel::Curves => "curves",
        })
    }
}

/// A frame matched to a posted receive.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: Rank,
    pub payload: Arc<[u8]>,
}

pub trait Fabric {
    type SendRequest;
    type RecvRequest;

    fn rank(&self) -> Rank;
    fn size(&self) -> usize;

    /// Start sending `payload`. The caller keeps the buffer alive until `test_send` reports
    /// completion.
    fn isend(&mut self, dst: Rank, channel: Channel, payload: Arc<[u8]>) -> Self::SendRequest;
    fn test_send(&mut self, request: &Self::SendRequest) -> bool;
    fn cancel_send(&mut self, request: Self::SendRequest);

    /// Post a receive slot on `channel`.
    fn irecv(&mut self, channel: Channel) -> Self::RecvRequest;
    /// Returns the matched frame once, when the slot completes.
    fn test_recv(&mut self, request: &mut Self::RecvRequest) -> Option<Delivery>;
    fn cancel_recv(&mut self, request: Self::RecvRequest);

    /// Block until every rank in `members` has arrived.
    fn barrier(&mut self, members: &[Rank]);
    /// Element-wise sum across all ranks; every rank receives the result in place.
    fn all_reduce_sum(&mut self, values: &mut [i64]);
}

pub mod channel;

#[cfg(test)]
mod channel_test;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rank {rank} is outside the cluster of {size}")]
    RankOutOfRange { rank: usize, size: usize },
    #[error("tag {0} is negative")]
    InvalidTag(i32),
    #[error("peer endpoint is gone")]
    Disconnected,
    #[error("message of {received} elements on tag {tag} overflows a buffer of {expected}")]
    Overflow {
        expected: usize,
        received: usize,
        tag: i32,
    },
    #[error("message on tag {tag} from rank {source_rank} carries a different element type")]
    TypeMismatch { tag: i32, source_rank: usize },
    #[error("buffer of {send} elements does not match {recv} across {size} ranks")]
    CollectiveMismatch {
        send: usize,
        recv: usize,
        size: usize,
    },
    #[error("cluster state was poisoned by a crashed rank")]
    Poisoned,
}

/// Source selector for a blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Rank(usize),
    /// match the next arrival from any rank
    Any,
}

/// Outcome of a blocking receive: who sent, and how many elements arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: usize,
    pub count: usize,
}

/// Blocking SPMD message-passing substrate consumed by the farm.
///
/// One endpoint per rank, used from a single logical thread. Point-to-point
/// messages are FIFO per `(source, tag)` pair; a wildcard receive resolves
/// arrivals in arrival order. Sends block only until locally completable,
/// receives block until a matching message arrives. A message larger than the
/// receive buffer is an error; a smaller one fills a prefix and reports the
/// actual count in [`Status`].
pub trait Transport {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn init(&mut self) -> Result<(), TransportError>;
    fn finalize(&mut self) -> Result<(), TransportError>;

    fn send_ints(&mut self, buf: &[i32], dest: usize, tag: i32) -> Result<(), TransportError>;
    fn recv_ints(
        &mut self,
        buf: &mut [i32],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError>;

    fn send_bytes(&mut self, buf: &[u8], dest: usize, tag: i32) -> Result<(), TransportError>;
    fn recv_bytes(
        &mut self,
        buf: &mut [u8],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError>;

    fn send_floats(&mut self, buf: &[f64], dest: usize, tag: i32) -> Result<(), TransportError>;
    fn recv_floats(
        &mut self,
        buf: &mut [f64],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError>;

    /// combined exchange for stencil-style neighbor patterns
    fn sendrecv_floats(
        &mut self,
        out: &[f64],
        dest: usize,
        send_tag: i32,
        inbuf: &mut [f64],
        source: Source,
        recv_tag: i32,
    ) -> Result<Status, TransportError>;

    fn broadcast_floats(&mut self, buf: &mut [f64], root: usize) -> Result<(), TransportError>;

    /// root splits `sendbuf` into `size()` equal chunks of `recvbuf.len()`
    fn scatter_floats(
        &mut self,
        sendbuf: &[f64],
        recvbuf: &mut [f64],
        root: usize,
    ) -> Result<(), TransportError>;

    fn allreduce_sum(
        &mut self,
        sendbuf: &[f64],
        recvbuf: &mut [f64],
    ) -> Result<(), TransportError>;

    fn barrier(&mut self) -> Result<(), TransportError>;

    /// seconds since an arbitrary cluster-wide epoch
    fn wall_time(&self) -> f64;
}

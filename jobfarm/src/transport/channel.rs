use super::{Source, Status, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};
use tracing::{debug, trace};

// transport-internal collective tags, above the farm's reserved range
const BCAST_TAG: i32 = 9101;
const SCATTER_TAG: i32 = 9102;
const REDUCE_TAG: i32 = 9103;

#[derive(Debug, Clone)]
enum Payload {
    Ints(Vec<i32>),
    Bytes(Vec<u8>),
    Floats(Vec<f64>),
}

#[derive(Debug, Clone)]
struct Envelope {
    source: usize,
    tag: i32,
    payload: Payload,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
struct ClusterShared {
    started: Instant,
    size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
}

/// In-process [`Transport`]: one endpoint per simulated rank, each driven by
/// its own thread.
///
/// Every endpoint owns a mailbox; sends enqueue at the destination and
/// complete immediately. Receives match `(source, tag)` against a stash of
/// already drained envelopes before blocking on the mailbox, so messages
/// stay FIFO per pair while wildcard receives observe arrival order.
#[derive(Debug)]
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: Vec<Envelope>,
    shared: Arc<ClusterShared>,
}

impl ChannelTransport {
    /// build `size` connected endpoints, one per rank
    pub fn cluster(size: usize) -> Vec<ChannelTransport> {
        let shared = Arc::new(ClusterShared {
            started: Instant::now(),
            size,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        });

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank,
                peers: senders.clone(),
                inbox,
                stash: Vec::new(),
                shared: shared.clone(),
            })
            .collect()
    }

    fn post(&mut self, dest: usize, tag: i32, payload: Payload) -> Result<(), TransportError> {
        if tag < 0 {
            return Err(TransportError::InvalidTag(tag));
        }
        let peer = self
            .peers
            .get(dest)
            .ok_or(TransportError::RankOutOfRange {
                rank: dest,
                size: self.peers.len(),
            })?;

        peer.send(Envelope {
            source: self.rank,
            tag,
            payload,
        })
        .map_err(|_| TransportError::Disconnected)
    }

    fn matches(envelope: &Envelope, source: Source, tag: i32) -> bool {
        envelope.tag == tag
            && match source {
                Source::Any => true,
                Source::Rank(rank) => envelope.source == rank,
            }
    }

    fn take(&mut self, source: Source, tag: i32) -> Result<Envelope, TransportError> {
        if tag < 0 {
            return Err(TransportError::InvalidTag(tag));
        }
        if let Source::Rank(rank) = source {
            if rank >= self.shared.size {
                return Err(TransportError::RankOutOfRange {
                    rank,
                    size: self.shared.size,
                });
            }
        }

        if let Some(pos) = self
            .stash
            .iter()
            .position(|envelope| Self::matches(envelope, source, tag))
        {
            return Ok(self.stash.remove(pos));
        }

        loop {
            let envelope = self
                .inbox
                .recv()
                .map_err(|_| TransportError::Disconnected)?;
            if Self::matches(&envelope, source, tag) {
                return Ok(envelope);
            }

            trace!(
                rank = self.rank,
                from = envelope.source,
                tag = envelope.tag,
                "stashing out-of-order arrival"
            );
            self.stash.push(envelope);
        }
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn init(&mut self) -> Result<(), TransportError> {
        debug!(rank = self.rank, size = self.shared.size, "endpoint up");
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), TransportError> {
        debug!(rank = self.rank, stashed = self.stash.len(), "endpoint down");
        Ok(())
    }

    fn send_ints(&mut self, buf: &[i32], dest: usize, tag: i32) -> Result<(), TransportError> {
        self.post(dest, tag, Payload::Ints(buf.to_vec()))
    }

    fn recv_ints(
        &mut self,
        buf: &mut [i32],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError> {
        let envelope = self.take(source, tag)?;
        let Payload::Ints(data) = envelope.payload else {
            return Err(TransportError::TypeMismatch {
                tag,
                source_rank: envelope.source,
            });
        };
        if data.len() > buf.len() {
            return Err(TransportError::Overflow {
                expected: buf.len(),
                received: data.len(),
                tag,
            });
        }
        buf[..data.len()].copy_from_slice(&data);

        Ok(Status {
            source: envelope.source,
            count: data.len(),
        })
    }

    fn send_bytes(&mut self, buf: &[u8], dest: usize, tag: i32) -> Result<(), TransportError> {
        self.post(dest, tag, Payload::Bytes(buf.to_vec()))
    }

    fn recv_bytes(
        &mut self,
        buf: &mut [u8],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError> {
        let envelope = self.take(source, tag)?;
        let Payload::Bytes(data) = envelope.payload else {
            return Err(TransportError::TypeMismatch {
                tag,
                source_rank: envelope.source,
            });
        };
        if data.len() > buf.len() {
            return Err(TransportError::Overflow {
                expected: buf.len(),
                received: data.len(),
                tag,
            });
        }
        buf[..data.len()].copy_from_slice(&data);

        Ok(Status {
            source: envelope.source,
            count: data.len(),
        })
    }

    fn send_floats(&mut self, buf: &[f64], dest: usize, tag: i32) -> Result<(), TransportError> {
        self.post(dest, tag, Payload::Floats(buf.to_vec()))
    }

    fn recv_floats(
        &mut self,
        buf: &mut [f64],
        source: Source,
        tag: i32,
    ) -> Result<Status, TransportError> {
        let envelope = self.take(source, tag)?;
        let Payload::Floats(data) = envelope.payload else {
            return Err(TransportError::TypeMismatch {
                tag,
                source_rank: envelope.source,
            });
        };
        if data.len() > buf.len() {
            return Err(TransportError::Overflow {
                expected: buf.len(),
                received: data.len(),
                tag,
            });
        }
        buf[..data.len()].copy_from_slice(&data);

        Ok(Status {
            source: envelope.source,
            count: data.len(),
        })
    }

    fn sendrecv_floats(
        &mut self,
        out: &[f64],
        dest: usize,
        send_tag: i32,
        inbuf: &mut [f64],
        source: Source,
        recv_tag: i32,
    ) -> Result<Status, TransportError> {
        // sends complete locally here, so plain send-then-receive cannot deadlock
        self.send_floats(out, dest, send_tag)?;
        self.recv_floats(inbuf, source, recv_tag)
    }

    fn broadcast_floats(&mut self, buf: &mut [f64], root: usize) -> Result<(), TransportError> {
        if root >= self.shared.size {
            return Err(TransportError::RankOutOfRange {
                rank: root,
                size: self.shared.size,
            });
        }

        if self.rank == root {
            for dest in 0..self.shared.size {
                if dest != root {
                    let data = buf.to_vec();
                    self.post(dest, BCAST_TAG, Payload::Floats(data))?;
                }
            }
            Ok(())
        } else {
            self.recv_floats(buf, Source::Rank(root), BCAST_TAG)?;
            Ok(())
        }
    }

    fn scatter_floats(
        &mut self,
        sendbuf: &[f64],
        recvbuf: &mut [f64],
        root: usize,
    ) -> Result<(), TransportError> {
        if root >= self.shared.size {
            return Err(TransportError::RankOutOfRange {
                rank: root,
                size: self.shared.size,
            });
        }

        let chunk = recvbuf.len();
        if self.rank == root {
            if sendbuf.len() != chunk * self.shared.size {
                return Err(TransportError::CollectiveMismatch {
                    send: sendbuf.len(),
                    recv: chunk,
                    size: self.shared.size,
                });
            }
            for dest in 0..self.shared.size {
                let part = &sendbuf[dest * chunk..(dest + 1) * chunk];
                if dest == root {
                    recvbuf.copy_from_slice(part);
                } else {
                    let data = part.to_vec();
                    self.post(dest, SCATTER_TAG, Payload::Floats(data))?;
                }
            }
            Ok(())
        } else {
            self.recv_floats(recvbuf, Source::Rank(root), SCATTER_TAG)?;
            Ok(())
        }
    }

    fn allreduce_sum(
        &mut self,
        sendbuf: &[f64],
        recvbuf: &mut [f64],
    ) -> Result<(), TransportError> {
        if sendbuf.len() != recvbuf.len() {
            return Err(TransportError::CollectiveMismatch {
                send: sendbuf.len(),
                recv: recvbuf.len(),
                size: self.shared.size,
            });
        }

        // reduce towards rank 0, then share the sums back out
        if self.rank == 0 {
            recvbuf.copy_from_slice(sendbuf);
            let mut incoming = vec![0.0; sendbuf.len()];
            for _ in 1..self.shared.size {
                let status = self.recv_floats(&mut incoming, Source::Any, REDUCE_TAG)?;
                if status.count != recvbuf.len() {
                    return Err(TransportError::CollectiveMismatch {
                        send: status.count,
                        recv: recvbuf.len(),
                        size: self.shared.size,
                    });
                }
                for (acc, contribution) in recvbuf.iter_mut().zip(incoming.iter()) {
                    *acc += contribution;
                }
            }
        } else {
            self.send_floats(sendbuf, 0, REDUCE_TAG)?;
        }

        self.broadcast_floats(recvbuf, 0)
    }

    fn barrier(&mut self) -> Result<(), TransportError> {
        let mut state = self
            .shared
            .barrier
            .lock()
            .map_err(|_| TransportError::Poisoned)?;
        let generation = state.generation;

        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.released.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            state = self
                .shared
                .released
                .wait(state)
                .map_err(|_| TransportError::Poisoned)?;
        }
        Ok(())
    }

    fn wall_time(&self) -> f64 {
        self.shared.started.elapsed().as_secs_f64()
    }
}

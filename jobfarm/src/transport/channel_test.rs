use super::{channel::ChannelTransport, Source, Transport, TransportError};
use std::thread;

#[test]
pub fn fifo_per_source_and_tag() {
    let mut cluster = ChannelTransport::cluster(2);
    let mut receiver = cluster.remove(1);
    let mut sender = cluster.remove(0);

    sender.send_ints(&[1], 1, 10).unwrap();
    sender.send_ints(&[2], 1, 10).unwrap();
    sender.send_ints(&[3], 1, 10).unwrap();

    let mut buf = [0i32; 1];
    for expected in 1..=3 {
        let status = receiver.recv_ints(&mut buf, Source::Rank(0), 10).unwrap();
        assert_eq!(expected, buf[0]);
        assert_eq!(0, status.source);
        assert_eq!(1, status.count);
    }
}

#[test]
pub fn tag_selection_skips_other_tags() {
    let mut cluster = ChannelTransport::cluster(2);
    let mut receiver = cluster.remove(1);
    let mut sender = cluster.remove(0);

    sender.send_ints(&[7], 1, 20).unwrap();
    sender.send_ints(&[8], 1, 30).unwrap();

    // the tag-30 message arrives second but matches first
    let mut buf = [0i32; 1];
    receiver.recv_ints(&mut buf, Source::Rank(0), 30).unwrap();
    assert_eq!(8, buf[0]);

    // the stashed tag-20 message is still deliverable
    receiver.recv_ints(&mut buf, Source::Rank(0), 20).unwrap();
    assert_eq!(7, buf[0]);
}

#[test]
pub fn wildcard_resolves_in_arrival_order() {
    let mut cluster = ChannelTransport::cluster(3);
    let mut receiver = cluster.remove(0);
    let mut second = cluster.remove(1);
    let mut first = cluster.remove(0);

    first.send_ints(&[1], 0, 40).unwrap();
    second.send_ints(&[2], 0, 40).unwrap();

    let mut buf = [0i32; 1];
    let status = receiver.recv_ints(&mut buf, Source::Any, 40).unwrap();
    assert_eq!(1, buf[0]);
    assert_eq!(1, status.source);

    let status = receiver.recv_ints(&mut buf, Source::Any, 40).unwrap();
    assert_eq!(2, buf[0]);
    assert_eq!(2, status.source);
}

#[test]
pub fn element_type_is_checked() {
    let mut cluster = ChannelTransport::cluster(2);
    let mut receiver = cluster.remove(1);
    let mut sender = cluster.remove(0);

    sender.send_floats(&[1.0], 1, 50).unwrap();

    let mut buf = [0i32; 1];
    let result = receiver.recv_ints(&mut buf, Source::Rank(0), 50);
    assert!(matches!(result, Err(TransportError::TypeMismatch { .. })));
}

#[test]
pub fn oversized_message_is_rejected() {
    let mut cluster = ChannelTransport::cluster(2);
    let mut receiver = cluster.remove(1);
    let mut sender = cluster.remove(0);

    sender.send_bytes(&[1, 2, 3, 4], 1, 60).unwrap();

    let mut buf = [0u8; 2];
    let result = receiver.recv_bytes(&mut buf, Source::Rank(0), 60);
    assert!(matches!(result, Err(TransportError::Overflow { .. })));
}

#[test]
pub fn short_message_reports_actual_count() {
    let mut cluster = ChannelTransport::cluster(2);
    let mut receiver = cluster.remove(1);
    let mut sender = cluster.remove(0);

    sender.send_bytes(&[9, 9], 1, 61).unwrap();

    let mut buf = [0u8; 8];
    let status = receiver.recv_bytes(&mut buf, Source::Rank(0), 61).unwrap();
    assert_eq!(2, status.count);
    assert_eq!(&[9u8, 9], &buf[..2]);
}

#[test]
pub fn negative_tags_are_invalid() {
    let mut cluster = ChannelTransport::cluster(1);
    let mut endpoint = cluster.remove(0);

    assert!(matches!(
        endpoint.send_ints(&[1], 0, -1),
        Err(TransportError::InvalidTag(-1))
    ));
    let mut buf = [0i32; 1];
    assert!(matches!(
        endpoint.recv_ints(&mut buf, Source::Any, -5),
        Err(TransportError::InvalidTag(-5))
    ));
}

#[test]
pub fn collectives_across_threads() {
    let size = 4;
    let cluster = ChannelTransport::cluster(size);

    let handles: Vec<_> = cluster
        .into_iter()
        .enumerate()
        .map(|(rank, mut endpoint)| {
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    endpoint.barrier().unwrap();

                    // broadcast from rank 1
                    let mut params = if rank == 1 { [3.5, 0.25] } else { [0.0, 0.0] };
                    endpoint.broadcast_floats(&mut params, 1).unwrap();
                    assert_eq!([3.5, 0.25], params);

                    // scatter one chunk of two elements per rank from rank 0
                    let sendbuf: Vec<f64> = if rank == 0 {
                        (0..2 * size).map(|i| i as f64).collect()
                    } else {
                        Vec::new()
                    };
                    let mut chunk = [0.0f64; 2];
                    endpoint.scatter_floats(&sendbuf, &mut chunk, 0).unwrap();
                    assert_eq!([(2 * rank) as f64, (2 * rank + 1) as f64], chunk);

                    // every rank contributes its own rank number
                    let mut sum = [0.0f64];
                    endpoint.allreduce_sum(&[rank as f64], &mut sum).unwrap();
                    assert_eq!(6.0, sum[0]);

                    // pairwise neighbor exchange on a ring
                    let right = (rank + 1) % size;
                    let left = (rank + size - 1) % size;
                    let mut from_left = [0.0f64];
                    let status = endpoint
                        .sendrecv_floats(
                            &[rank as f64],
                            right,
                            70,
                            &mut from_left,
                            Source::Rank(left),
                            70,
                        )
                        .unwrap();
                    assert_eq!(left, status.source);
                    assert_eq!(left as f64, from_left[0]);

                    endpoint.barrier().unwrap();
                })
                .unwrap()
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
pub fn wall_time_advances() {
    let mut cluster = ChannelTransport::cluster(1);
    let endpoint = cluster.remove(0);

    let before = endpoint.wall_time();
    thread::sleep(std::time::Duration::from_millis(5));
    assert!(endpoint.wall_time() > before);
}

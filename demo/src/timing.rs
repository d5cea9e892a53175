use crate::{TimingArgs, EXIT_TRANSPORT};
use jobfarm::{ChannelTransport, Source, Tag, Transport, TransportError};
use std::{process::exit, thread};
use tracing::{error, info};
use tracing_unwrap::ResultExt;

// application tags, outside the farm's reserved set
const PING: i32 = 7101;
const PONG: i32 = 7102;

/// round-trip timing between rank 0 and rank 1, straight on the transport
pub fn run(args: &TimingArgs) {
    debug_assert!(!Tag::reserves(PING) && !Tag::reserves(PONG));

    let rounds = args.rounds;
    let floats = args.floats;
    info!(rounds, floats, "measuring round trips");

    let mut cluster = ChannelTransport::cluster(2);
    let echo = cluster.remove(1);
    let origin = cluster.remove(0);

    let echo_thread = thread::Builder::new()
        .name(String::from("rank-1"))
        .spawn(move || echo_side(echo, rounds, floats))
        .unwrap_or_log();

    match origin_side(origin, rounds, floats) {
        Ok((total, fastest)) => {
            info!(
                avg_us = total / rounds as f64 * 1e6,
                min_us = fastest * 1e6,
                "round trips done"
            );
        }
        Err(e) => {
            error!(error = %e, "Timing failed: {e}");
            exit(EXIT_TRANSPORT)
        }
    }

    echo_thread
        .join()
        .expect("echo thread did not panic")
        .unwrap_or_log();
}

fn origin_side(
    mut transport: ChannelTransport,
    rounds: usize,
    floats: usize,
) -> Result<(f64, f64), TransportError> {
    transport.init()?;
    transport.barrier()?;

    let payload = vec![1.0f64; floats];
    let mut echoed = vec![0.0f64; floats];
    let mut total = 0.0f64;
    let mut fastest = f64::MAX;

    for _ in 0..rounds {
        let start = transport.wall_time();
        transport.send_floats(&payload, 1, PING)?;
        transport.recv_floats(&mut echoed, Source::Rank(1), PONG)?;
        let elapsed = transport.wall_time() - start;

        total += elapsed;
        fastest = fastest.min(elapsed);
    }

    transport.finalize()?;
    Ok((total, fastest))
}

fn echo_side(
    mut transport: ChannelTransport,
    rounds: usize,
    floats: usize,
) -> Result<(), TransportError> {
    transport.init()?;
    transport.barrier()?;

    let mut buffer = vec![0.0f64; floats];
    for _ in 0..rounds {
        let status = transport.recv_floats(&mut buffer, Source::Rank(0), PING)?;
        transport.send_floats(&buffer[..status.count], 0, PONG)?;
    }

    transport.finalize()
}

use crate::{HeatArgs, EXIT_CONFIG, EXIT_TRANSPORT};
use jobfarm::{ChannelTransport, Source, Tag, Transport, TransportError};
use std::{process::exit, thread};
use tracing::{error, info};
use tracing_unwrap::ResultExt;

// halo exchange tags, outside the farm's reserved set
const HALO_LEFT: i32 = 7201;
const HALO_RIGHT: i32 = 7202;

const ALPHA: f64 = 0.25;
const BOUNDARY: f64 = 0.0;
const HOT_SPOT: f64 = 100.0;

/// Explicit relaxation of a 1D heat rod, one strip of cells per rank.
///
/// Exercises the full collective surface: parameters go out by broadcast,
/// the initial rod by scatter, halos by sendrecv, and the residual by
/// allreduce. This is a consumer of the transport, not of the farm.
pub fn run(args: &HeatArgs) {
    debug_assert!(!Tag::reserves(HALO_LEFT) && !Tag::reserves(HALO_RIGHT));

    if args.ranks == 0 || args.cells == 0 {
        error!("ranks and cells must both be at least 1");
        exit(EXIT_CONFIG)
    }
    info!(
        ranks = args.ranks,
        cells = args.cells,
        steps = args.steps,
        "relaxing heat rod"
    );

    let size = args.ranks;
    let cells = args.cells;
    let steps = args.steps;

    let handles: Vec<_> = ChannelTransport::cluster(size)
        .into_iter()
        .enumerate()
        .map(|(rank, endpoint)| {
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || relax(endpoint, cells, steps))
                .unwrap_or_log()
        })
        .collect();

    for handle in handles {
        if let Err(e) = handle.join().expect("rank thread did not panic") {
            error!(error = %e, "Heat rod failed: {e}");
            exit(EXIT_TRANSPORT)
        }
    }
}

fn relax(mut transport: ChannelTransport, cells: usize, steps: usize) -> Result<(), TransportError> {
    transport.init()?;
    let rank = transport.rank();
    let size = transport.size();

    // root lays out the initial rod with one hot spot, everyone gets a strip
    let rod: Vec<f64> = if rank == 0 {
        let total = cells * size;
        (0..total)
            .map(|cell| if cell == total / 2 { HOT_SPOT } else { 0.0 })
            .collect()
    } else {
        Vec::new()
    };
    let mut strip = vec![0.0f64; cells];
    transport.scatter_floats(&rod, &mut strip, 0)?;

    let mut params = [ALPHA, BOUNDARY];
    transport.broadcast_floats(&mut params, 0)?;
    let [alpha, boundary] = params;

    let mut next = vec![0.0f64; cells];
    let mut residual = [0.0f64];
    for step in 0..steps {
        let mut left_halo = [boundary];
        let mut right_halo = [boundary];

        if rank > 0 {
            transport.sendrecv_floats(
                &strip[..1],
                rank - 1,
                HALO_LEFT,
                &mut left_halo,
                Source::Rank(rank - 1),
                HALO_RIGHT,
            )?;
        }
        if rank < size - 1 {
            transport.sendrecv_floats(
                &strip[cells - 1..],
                rank + 1,
                HALO_RIGHT,
                &mut right_halo,
                Source::Rank(rank + 1),
                HALO_LEFT,
            )?;
        }

        let mut local_change = 0.0f64;
        for cell in 0..cells {
            let left = if cell == 0 { left_halo[0] } else { strip[cell - 1] };
            let right = if cell == cells - 1 {
                right_halo[0]
            } else {
                strip[cell + 1]
            };
            next[cell] = strip[cell] + alpha * (left - 2.0 * strip[cell] + right);
            let delta = next[cell] - strip[cell];
            local_change += delta * delta;
        }
        std::mem::swap(&mut strip, &mut next);

        if (step + 1) % 100 == 0 || step + 1 == steps {
            transport.allreduce_sum(&[local_change], &mut residual)?;
            if rank == 0 {
                info!(step = step + 1, residual = residual[0], "relaxation step");
            }
        }
    }

    // mean rod temperature as the closing sanity figure
    let local_sum: f64 = strip.iter().sum();
    let mut global_sum = [0.0f64];
    transport.allreduce_sum(&[local_sum], &mut global_sum)?;
    transport.barrier()?;
    if rank == 0 {
        info!(
            mean = global_sum[0] / (cells * size) as f64,
            "rod settled"
        );
    }

    transport.finalize()
}

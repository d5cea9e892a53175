use crate::{
    codec::Codec,
    controller::{run_inline, Controller},
    framing::{FrameError, DEFAULT_MAX_FRAME},
    job::{ErrorSink, JobError, JobHandler, ResultSink},
    transport::{Transport, TransportError},
    worker::Worker,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum FarmError {
    #[error("transport layer failed")]
    Transport(#[from] TransportError),
    #[error("message framing failed")]
    Frame(#[from] FrameError),
    #[error("controller rank {0} was given no data source")]
    MissingSource(usize),
    #[error("controller rank {controller} is outside the cluster of {size}")]
    ControllerOutOfRange { controller: usize, size: usize },
}

/// Accounting from one farm run.
///
/// Workers return an all-zero report; the numbers live on the controller.
/// After a clean run `dispatched == collected` and every worker has been
/// released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub dispatched: u64,
    pub collected: u64,
    pub deadline_hit: bool,
}

/// Knobs shared by every rank of a farm run.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// rank that owns the data source and dispatches items
    pub controller_rank: usize,
    /// optional wall-clock budget, observed between dispatch rounds
    pub time_limit: Option<Duration>,
    /// upper bound accepted for a single framed payload
    pub max_frame: usize,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            controller_rank: 0,
            time_limit: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl FarmConfig {
    pub fn builder() -> FarmConfigBuilder {
        FarmConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct FarmConfigBuilder {
    config: FarmConfig,
}

impl FarmConfigBuilder {
    pub fn controller_rank(mut self, rank: usize) -> Self {
        self.config.controller_rank = rank;
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.config.time_limit = Some(limit);
        self
    }

    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.config.max_frame = bytes;
        self
    }

    pub fn build(self) -> FarmConfig {
        self.config
    }
}

// Scoped transport acquisition: init on open, finalize exactly once on every
// exit path including unwinding.
struct Session<T: Transport> {
    transport: T,
    finished: bool,
}

impl<T: Transport> Session<T> {
    fn open(mut transport: T) -> Result<Self, TransportError> {
        transport.init()?;
        Ok(Self {
            transport,
            finished: false,
        })
    }

    fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.finished = true;
        self.transport.finalize()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.transport.finalize() {
                error!(error = %e, "transport finalize failed during teardown");
            }
        }
    }
}

/// One farm run, constructed identically on every rank.
///
/// `run()` elects the role from the transport rank: the configured
/// controller rank iterates the data source and dispatches, everyone else
/// loops as a worker. On a single-rank cluster the controller processes the
/// jobs itself.
///
/// Results reach the [`on_result`](Farm::on_result) sink in dispatch order,
/// which is request-arrival order, not data-source order; stamp items and
/// reorder downstream if source order matters.
pub struct Farm<T, C, H: JobHandler> {
    transport: T,
    config: FarmConfig,
    codec: C,
    handler: H,
    source: Option<Box<dyn Iterator<Item = H::Item> + Send>>,
    results_sink: Option<ResultSink<H::Output>>,
    error_sink: Option<ErrorSink>,
}

impl<T, C, H> Farm<T, C, H>
where
    T: Transport,
    H: JobHandler,
    C: Codec<H::Item> + Codec<H::Output>,
{
    pub fn new(transport: T, config: FarmConfig, codec: C, handler: H) -> Self {
        Self {
            transport,
            config,
            codec,
            handler,
            source: None,
            results_sink: None,
            error_sink: None,
        }
    }

    /// attach the data source; required on the controller rank, ignored elsewhere
    pub fn source<I>(mut self, source: I) -> Self
    where
        I: IntoIterator<Item = H::Item>,
        I::IntoIter: Send + 'static,
    {
        self.source = Some(Box::new(source.into_iter()));
        self
    }

    pub fn on_result(mut self, sink: impl FnMut(Option<H::Output>) + Send + 'static) -> Self {
        self.results_sink = Some(Box::new(sink));
        self
    }

    pub fn on_error(mut self, sink: impl FnMut(JobError) + Send + 'static) -> Self {
        self.error_sink = Some(Box::new(sink));
        self
    }

    /// Run to completion on this rank. Blocks until the whole farm has
    /// terminated from this rank's point of view.
    pub fn run(self) -> Result<RunReport, FarmError> {
        let Farm {
            transport,
            config,
            codec,
            mut handler,
            source,
            results_sink,
            error_sink,
        } = self;

        let mut session = Session::open(transport)?;
        let rank = session.transport().rank();
        let size = session.transport().size();
        if config.controller_rank >= size {
            return Err(FarmError::ControllerOutOfRange {
                controller: config.controller_rank,
                size,
            });
        }

        let deadline = config
            .time_limit
            .map(|limit| session.transport().wall_time() + limit.as_secs_f64());

        let report = if rank == config.controller_rank {
            let mut source = source.ok_or(FarmError::MissingSource(rank))?;
            info!(rank, size, "controller up");

            if size == 1 {
                run_inline(
                    session.transport(),
                    &mut handler,
                    source.as_mut(),
                    deadline,
                    results_sink,
                    error_sink,
                )
            } else {
                let mut controller: Controller<'_, T, C, H::Output> = Controller::new(
                    session.transport(),
                    &codec,
                    config.controller_rank,
                    config.max_frame,
                    deadline,
                    results_sink,
                    error_sink,
                );
                let outcome = controller
                    .dispatch(source.as_mut())
                    .and_then(|_| controller.drain());
                if let Err(e) = outcome {
                    controller.abort();
                    return Err(e);
                }
                controller.into_report()
            }
        } else {
            debug!(rank, size, "worker up");
            Worker::new(
                session.transport(),
                &codec,
                &mut handler,
                config.controller_rank,
                config.max_frame,
            )
            .run()?;
            RunReport::default()
        };

        session.close()?;
        Ok(report)
    }
}

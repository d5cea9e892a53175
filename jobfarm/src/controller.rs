use crate::{
    codec::Codec,
    framing::{recv_frame, send_frame},
    job::{panic_message, trap, ErrorSink, JobError, JobHandler, ResultSink},
    runtime::{FarmError, RunReport},
    state::{ActiveSet, NodeCursor},
    tags::Tag,
    transport::{Source, Transport},
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

/// Dispatch side of the farm, running on the controller rank.
///
/// One dispatch round per item: wait for a `RequestWork`, collect the
/// requesting worker's previous result if it has one outstanding, then
/// activate it and send the item. Results therefore surface in request
/// arrival order, not data-source order.
pub(crate) struct Controller<'f, T, C, R> {
    transport: &'f mut T,
    codec: &'f C,
    controller_rank: usize,
    max_frame: usize,
    /// wall-clock cutoff, checked between dispatch rounds only
    deadline: Option<f64>,
    active: ActiveSet,
    drained: bool,
    results_sink: Option<ResultSink<R>>,
    error_sink: Option<ErrorSink>,
    report: RunReport,
}

impl<'f, T, C, R> Controller<'f, T, C, R>
where
    T: Transport,
    C: Codec<R>,
{
    pub(crate) fn new(
        transport: &'f mut T,
        codec: &'f C,
        controller_rank: usize,
        max_frame: usize,
        deadline: Option<f64>,
        results_sink: Option<ResultSink<R>>,
        error_sink: Option<ErrorSink>,
    ) -> Self {
        let size = transport.size();
        Self {
            transport,
            codec,
            controller_rank,
            max_frame,
            deadline,
            active: ActiveSet::new(size),
            drained: false,
            results_sink,
            error_sink,
            report: RunReport::default(),
        }
    }

    pub(crate) fn dispatch<J>(
        &mut self,
        source: &mut dyn Iterator<Item = J>,
    ) -> Result<(), FarmError>
    where
        C: Codec<J>,
    {
        loop {
            if self.deadline_passed() {
                info!("wall clock limit reached, moving to shutdown");
                self.report.deadline_hit = true;
                break;
            }
            let Some(item) = source.next() else { break };

            // encode before claiming a worker so a failed item costs nothing
            let payload = match self.codec.encode(&item) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "dropping item that did not encode");
                    continue;
                }
            };

            let worker = self.next_free_worker()?;
            if self.active.is_active(worker) {
                self.collect_from(worker)?;
            }

            self.active.activate(worker);
            self.transport
                .send_ints(&[1], worker, Tag::DataAvailable.into())?;
            send_frame(self.transport, worker, Tag::MessageData, &payload)?;
            self.report.dispatched += 1;
            debug!(worker, bytes = payload.len(), "item dispatched");
        }

        Ok(())
    }

    /// Sweep the workers in node order: wait for each to go idle, collect a
    /// still-outstanding result, then release it with `DataAvailable = 0`.
    /// Runs at most once; repeat calls return immediately.
    pub(crate) fn drain(&mut self) -> Result<(), FarmError> {
        if self.drained {
            debug!("drain already completed, nothing to do");
            return Ok(());
        }

        let size = self.transport.size();
        let mut cursor = NodeCursor::new();
        while let Some(node) = cursor.next_node(size, self.controller_rank) {
            let mut request = [0i32; 1];
            self.transport
                .recv_ints(&mut request, Source::Rank(node), Tag::RequestWork.into())?;

            if self.active.is_active(node) {
                self.collect_from(node)?;
            }
            self.active.deactivate(node);
            self.transport
                .send_ints(&[0], node, Tag::DataAvailable.into())?;
            debug!(node, "worker released");
        }

        self.drained = true;
        info!(
            dispatched = self.report.dispatched,
            collected = self.report.collected,
            "farm drained"
        );
        Ok(())
    }

    /// best-effort shutdown signal to every worker after a fatal error
    pub(crate) fn abort(&mut self) {
        warn!("dispatch failed, signalling shutdown to all workers");

        let size = self.transport.size();
        let mut cursor = NodeCursor::new();
        while let Some(node) = cursor.next_node(size, self.controller_rank) {
            if let Err(e) = self
                .transport
                .send_ints(&[0], node, Tag::DataAvailable.into())
            {
                warn!(node, error = %e, "shutdown signal did not reach worker");
            }
        }
    }

    pub(crate) fn into_report(self) -> RunReport {
        self.report
    }

    #[cfg(test)]
    pub(crate) fn active_workers(&self) -> usize {
        self.active.active_count()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|cutoff| self.transport.wall_time() >= cutoff)
            .unwrap_or(false)
    }

    /// Block until a valid `RequestWork` arrives and return the sender rank.
    /// Malformed requests are logged and skipped, never fatal.
    fn next_free_worker(&mut self) -> Result<usize, FarmError> {
        let size = self.transport.size();
        loop {
            let mut request = [0i32; 1];
            let status =
                self.transport
                    .recv_ints(&mut request, Source::Any, Tag::RequestWork.into())?;
            let claimed = request[0];

            let valid = claimed >= 0
                && (claimed as usize) < size
                && claimed as usize == status.source
                && status.source != self.controller_rank;
            if !valid {
                warn!(
                    claimed,
                    source = status.source,
                    "ignoring malformed work request"
                );
                continue;
            }

            return Ok(status.source);
        }
    }

    /// Receive the result/error frame pair from `worker` and hand both to the
    /// user sinks. The round failed iff the error frame is non-empty.
    fn collect_from(&mut self, worker: usize) -> Result<(), FarmError> {
        let (result_bytes, _) = recv_frame(
            self.transport,
            Source::Rank(worker),
            Tag::MessageResult,
            self.max_frame,
        )?;
        let (error_bytes, _) = recv_frame(
            self.transport,
            Source::Rank(worker),
            Tag::MessageError,
            self.max_frame,
        )?;
        self.report.collected += 1;

        let failed = !error_bytes.is_empty();
        let result = if failed {
            None
        } else {
            match self.codec.decode(&result_bytes) {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(worker, error = %e, "dropping result that did not decode");
                    None
                }
            }
        };
        let job_error = failed.then(|| JobError::from_payload(error_bytes));

        deliver(
            &mut self.results_sink,
            &mut self.error_sink,
            worker,
            result,
            job_error,
        );
        Ok(())
    }
}

/// Single-rank fallback: no workers exist, so the controller runs the job
/// handler itself between drawing items, with the same sink semantics.
pub(crate) fn run_inline<T, H>(
    transport: &T,
    handler: &mut H,
    source: &mut dyn Iterator<Item = H::Item>,
    deadline: Option<f64>,
    mut results_sink: Option<ResultSink<H::Output>>,
    mut error_sink: Option<ErrorSink>,
) -> RunReport
where
    T: Transport,
    H: JobHandler,
{
    let mut report = RunReport::default();
    info!("single rank cluster, processing jobs on the controller");

    if let Err(e) = trap("init handler", || handler.init()) {
        warn!(error = %e, "init handler failed, continuing");
    }

    loop {
        let deadline_passed = deadline
            .map(|cutoff| transport.wall_time() >= cutoff)
            .unwrap_or(false);
        if deadline_passed {
            info!("wall clock limit reached, stopping");
            report.deadline_hit = true;
            break;
        }
        let Some(item) = source.next() else { break };
        report.dispatched += 1;

        let (result, error) = match trap("job handler", || handler.process(item)) {
            Ok(output) => (Some(output), None),
            Err(e) => (None, Some(e)),
        };
        report.collected += 1;
        deliver(
            &mut results_sink,
            &mut error_sink,
            transport.rank(),
            result,
            error,
        );
    }

    if let Err(e) = trap("cleanup handler", || handler.cleanup()) {
        warn!(error = %e, "cleanup handler failed");
    }
    report
}

// Sinks run on the controller thread in result-then-error order. A panicking
// sink is trapped and logged so the dispatch protocol stays balanced.
fn deliver<R>(
    results_sink: &mut Option<ResultSink<R>>,
    error_sink: &mut Option<ErrorSink>,
    worker: usize,
    result: Option<R>,
    error: Option<JobError>,
) {
    if let Some(sink) = results_sink.as_mut() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink(result))) {
            error!(
                worker,
                cause = panic_message(payload.as_ref()),
                "results handler panicked, continuing"
            );
        }
    }

    if let Some(job_error) = error {
        match error_sink.as_mut() {
            Some(sink) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink(job_error))) {
                    error!(
                        worker,
                        cause = panic_message(payload.as_ref()),
                        "error handler panicked, continuing"
                    );
                }
            }
            None => warn!(worker, error = %job_error, "job failed"),
        }
    }
}

use crate::{
    codec::Codec,
    framing::{recv_frame, send_frame},
    job::{trap, JobError, JobHandler},
    runtime::FarmError,
    tags::Tag,
    transport::{Source, Transport},
};
use tracing::{debug, info, warn};

/// Worker side of the farm: init once, then request/receive/process/return
/// until the controller signals termination, then cleanup once.
pub(crate) struct Worker<'f, T, C, H> {
    transport: &'f mut T,
    codec: &'f C,
    handler: &'f mut H,
    controller_rank: usize,
    max_frame: usize,
}

impl<'f, T, C, H> Worker<'f, T, C, H>
where
    T: Transport,
    H: JobHandler,
    C: Codec<H::Item> + Codec<H::Output>,
{
    pub(crate) fn new(
        transport: &'f mut T,
        codec: &'f C,
        handler: &'f mut H,
        controller_rank: usize,
        max_frame: usize,
    ) -> Self {
        Self {
            transport,
            codec,
            handler,
            controller_rank,
            max_frame,
        }
    }

    pub(crate) fn run(&mut self) -> Result<(), FarmError> {
        let rank = self.transport.rank();

        if let Err(e) = trap("init handler", || self.handler.init()) {
            warn!(rank, error = %e, "init handler failed, continuing");
        }

        let mut processed = 0u64;
        loop {
            self.transport.send_ints(
                &[rank as i32],
                self.controller_rank,
                Tag::RequestWork.into(),
            )?;

            let mut flag = [0i32; 1];
            self.transport.recv_ints(
                &mut flag,
                Source::Rank(self.controller_rank),
                Tag::DataAvailable.into(),
            )?;
            if flag[0] == 0 {
                debug!(rank, processed, "shutdown signal received");
                break;
            }

            let (item_bytes, _) = recv_frame(
                self.transport,
                Source::Rank(self.controller_rank),
                Tag::MessageData,
                self.max_frame,
            )?;

            // every received item is answered with exactly one result/error
            // frame pair, whatever went wrong in between
            let (result_bytes, error) = self.run_job(item_bytes);
            send_frame(
                self.transport,
                self.controller_rank,
                Tag::MessageResult,
                &result_bytes,
            )?;
            let error_bytes = error.map(JobError::into_payload).unwrap_or_default();
            send_frame(
                self.transport,
                self.controller_rank,
                Tag::MessageError,
                &error_bytes,
            )?;
            processed += 1;
        }

        if let Err(e) = trap("cleanup handler", || self.handler.cleanup()) {
            warn!(rank, error = %e, "cleanup handler failed");
        }
        info!(rank, processed, "worker done");
        Ok(())
    }

    fn run_job(&mut self, item_bytes: Vec<u8>) -> (Vec<u8>, Option<JobError>) {
        let item: H::Item = match self.codec.decode(&item_bytes) {
            Ok(item) => item,
            Err(e) => {
                return (
                    Vec::new(),
                    Some(JobError::new(format!("work item did not decode: {e}"))),
                )
            }
        };

        match trap("job handler", || self.handler.process(item)) {
            Ok(output) => match self.codec.encode(&output) {
                Ok(bytes) => (bytes, None),
                Err(e) => (
                    Vec::new(),
                    Some(JobError::new(format!("result did not encode: {e}"))),
                ),
            },
            Err(error) => (Vec::new(), Some(error)),
        }
    }
}

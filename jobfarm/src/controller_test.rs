use crate::{
    codec::{BincodeCodec, Codec, CodecError},
    controller::Controller,
    framing::{recv_frame, send_frame, DEFAULT_MAX_FRAME},
    job::job_fn,
    tags::Tag,
    transport::{channel::ChannelTransport, Source, Transport},
    worker::Worker,
};
use std::{
    sync::{Arc, Mutex},
    thread,
};

fn controller_worker_pair() -> (ChannelTransport, ChannelTransport) {
    let mut cluster = ChannelTransport::cluster(2);
    let worker_end = cluster.remove(1);
    let controller_end = cluster.remove(0);
    (controller_end, worker_end)
}

#[test]
pub fn dispatch_then_drain_accounts_for_everything() {
    let (mut controller_end, mut worker_end) = controller_worker_pair();

    let worker_thread = thread::spawn(move || {
        let codec = BincodeCodec;
        let mut handler = job_fn(|x: i32| Ok(x + 1));
        Worker::new(&mut worker_end, &codec, &mut handler, 0, DEFAULT_MAX_FRAME)
            .run()
            .unwrap();
    });

    let codec = BincodeCodec;
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_collected = collected.clone();

    let mut controller: Controller<'_, _, _, i32> = Controller::new(
        &mut controller_end,
        &codec,
        0,
        DEFAULT_MAX_FRAME,
        None,
        Some(Box::new(move |result| {
            sink_collected.lock().unwrap().push(result)
        })),
        None,
    );

    let mut source = vec![1i32, 2, 3].into_iter();
    controller.dispatch(&mut source).unwrap();
    controller.drain().unwrap();
    assert_eq!(0, controller.active_workers());

    // drain is a no-op the second time around
    controller.drain().unwrap();

    let report = controller.into_report();
    assert_eq!(3, report.dispatched);
    assert_eq!(3, report.collected);
    assert!(!report.deadline_hit);

    worker_thread.join().unwrap();
    assert_eq!(vec![Some(2), Some(3), Some(4)], *collected.lock().unwrap());
}

#[test]
pub fn malformed_work_requests_are_suppressed() {
    let (mut controller_end, mut worker_end) = controller_worker_pair();
    let codec = BincodeCodec;

    // a hand-scripted worker that first claims a rank outside the cluster
    let worker_thread = thread::spawn(move || {
        let codec = BincodeCodec;

        worker_end
            .send_ints(&[5], 0, Tag::RequestWork.into())
            .unwrap();
        worker_end
            .send_ints(&[1], 0, Tag::RequestWork.into())
            .unwrap();

        let mut flag = [0i32; 1];
        worker_end
            .recv_ints(&mut flag, Source::Rank(0), Tag::DataAvailable.into())
            .unwrap();
        assert_eq!(1, flag[0]);
        let (item_bytes, _) = recv_frame(
            &mut worker_end,
            Source::Rank(0),
            Tag::MessageData,
            DEFAULT_MAX_FRAME,
        )
        .unwrap();
        let item: i32 = codec.decode(&item_bytes).unwrap();
        assert_eq!(41, item);

        let result_bytes = codec.encode(&(item + 1)).unwrap();
        send_frame(&mut worker_end, 0, Tag::MessageResult, &result_bytes).unwrap();
        send_frame(&mut worker_end, 0, Tag::MessageError, &[]).unwrap();

        worker_end
            .send_ints(&[1], 0, Tag::RequestWork.into())
            .unwrap();
        worker_end
            .recv_ints(&mut flag, Source::Rank(0), Tag::DataAvailable.into())
            .unwrap();
        assert_eq!(0, flag[0]);
    });

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_collected = collected.clone();
    let mut controller: Controller<'_, _, _, i32> = Controller::new(
        &mut controller_end,
        &codec,
        0,
        DEFAULT_MAX_FRAME,
        None,
        Some(Box::new(move |result| {
            sink_collected.lock().unwrap().push(result)
        })),
        None,
    );

    let mut source = vec![41i32].into_iter();
    controller.dispatch(&mut source).unwrap();
    controller.drain().unwrap();

    let report = controller.into_report();
    assert_eq!(1, report.dispatched);
    assert_eq!(1, report.collected);

    worker_thread.join().unwrap();
    assert_eq!(vec![Some(42)], *collected.lock().unwrap());
}

// codec that refuses one specific value, for the drop-and-continue path
struct Superstitious;

impl Codec<i32> for Superstitious {
    fn encode(&self, value: &i32) -> Result<Vec<u8>, CodecError> {
        if *value == 13 {
            return Err(CodecError::Encode(String::from("not that one")));
        }
        Ok(value.to_le_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i32, CodecError> {
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| CodecError::Decode(format!("expected 4 bytes, got {}", bytes.len())))?;
        Ok(i32::from_le_bytes(bytes))
    }
}

#[test]
pub fn items_that_do_not_encode_are_dropped() {
    let (mut controller_end, mut worker_end) = controller_worker_pair();

    let worker_thread = thread::spawn(move || {
        let codec = Superstitious;
        let mut handler = job_fn(|x: i32| Ok(x + 1));
        Worker::new(&mut worker_end, &codec, &mut handler, 0, DEFAULT_MAX_FRAME)
            .run()
            .unwrap();
    });

    let codec = Superstitious;
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_collected = collected.clone();
    let mut controller: Controller<'_, _, _, i32> = Controller::new(
        &mut controller_end,
        &codec,
        0,
        DEFAULT_MAX_FRAME,
        None,
        Some(Box::new(move |result| {
            sink_collected.lock().unwrap().push(result)
        })),
        None,
    );

    // 13 is dropped at encode time, 7 goes through
    let mut source = vec![13i32, 7].into_iter();
    controller.dispatch(&mut source).unwrap();
    controller.drain().unwrap();

    let report = controller.into_report();
    assert_eq!(1, report.dispatched);
    assert_eq!(1, report.collected);

    worker_thread.join().unwrap();
    assert_eq!(vec![Some(8)], *collected.lock().unwrap());
}

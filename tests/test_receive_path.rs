//! Inbound path: per-mode de-framing, per-producer reassembly, and the
//! out-of-order drop rules.

mod common;

use calyx::manager::framing::{put_block, put_u32};
use calyx::types::*;
use common::*;

/// `<u32 counter><u8 flags>` then one length-prefixed body per entry.
fn fragment_frame(counter: u32, flags: u8, bodies: &[&[u8]]) -> Vec<u8> {
    let mut frame = Vec::new();
    put_u32(&mut frame, counter);
    frame.push(flags);
    for body in bodies {
        put_block(&mut frame, body);
    }
    frame
}

fn received(chan: &TestChannel) -> Vec<Vec<u8>> {
    chan.recorder
        .lock()
        .unwrap()
        .received
        .iter()
        .map(|(bytes, _)| bytes.clone())
        .collect()
}

#[tokio::test]
async fn single_mode_delivers_bytes_as_one_package() {
    let chan = start_channel(EncodingMode::Single).await;
    let link = create_link(&chan).await;
    let conn = open_connection(&chan, &link).await;

    chan.harness
        .transport_sdk()
        .on_receive(&link, receive_params(&link), b"plain package".to_vec());
    chan.manager.wait_for_callbacks().await;

    let recorder = chan.recorder.lock().unwrap();
    assert_eq!(recorder.received.len(), 1);
    assert_eq!(recorder.received[0].0, b"plain package");
    assert_eq!(recorder.received[0].1, vec![conn]);
}

#[tokio::test]
async fn batch_mode_splits_length_prefixed_packages() {
    let chan = start_channel(EncodingMode::Batch).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;

    let mut frame = Vec::new();
    put_block(&mut frame, b"one");
    put_block(&mut frame, b"second package");
    chan.harness
        .transport_sdk()
        .on_receive(&link, receive_params(&link), frame);
    chan.manager.wait_for_callbacks().await;

    assert_eq!(received(&chan), vec![b"one".to_vec(), b"second package".to_vec()]);
}

#[tokio::test]
async fn fragment_gap_drops_pending_buffer() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;
    let transport_sdk = chan.harness.transport_sdk();

    // counter 0 opens a package that continues in the next fragment
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(0, 0b10, &[b"first half"]),
    );
    // counter 2: the continuation (counter 1) was lost
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(2, 0b01, &[b"second half"]),
    );
    chan.manager.wait_for_callbacks().await;

    assert!(
        received(&chan).is_empty(),
        "no partial package may be delivered"
    );

    // the stream recovers with the next in-order, self-contained fragment
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(3, 0, &[b"fresh"]),
    );
    chan.manager.wait_for_callbacks().await;

    assert_eq!(received(&chan), vec![b"fresh".to_vec()]);
}

#[tokio::test]
async fn fragments_spanning_actions_reassemble() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;
    let transport_sdk = chan.harness.transport_sdk();

    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(0, 0b10, &[b"abc-"]),
    );
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(1, 0b11, &[b"def-"]),
    );
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        fragment_frame(2, 0b01, &[b"ghi"]),
    );
    chan.manager.wait_for_callbacks().await;

    assert_eq!(received(&chan), vec![b"abc-def-ghi".to_vec()]);
}

#[tokio::test]
async fn whole_packages_batch_inside_one_fragment_frame() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;

    chan.harness.transport_sdk().on_receive(
        &link,
        receive_params(&link),
        fragment_frame(0, 0, &[b"alpha", b"beta"]),
    );
    chan.manager.wait_for_callbacks().await;

    assert_eq!(received(&chan), vec![b"alpha".to_vec(), b"beta".to_vec()]);
}

#[tokio::test]
async fn multiple_producers_reassemble_independently() {
    let chan = start_channel(EncodingMode::FragmentMultipleProducer).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;
    let transport_sdk = chan.harness.transport_sdk();

    let producer_a = [0x0a; 16];
    let producer_b = [0x0b; 16];
    let frame = |producer: &[u8], counter: u32, flags: u8, body: &[u8]| {
        let mut f = producer.to_vec();
        f.extend(fragment_frame(counter, flags, &[body]));
        f
    };

    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        frame(&producer_a, 0, 0b10, b"a-start-"),
    );
    // producer B interleaves without disturbing A's pending buffer
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        frame(&producer_b, 0, 0, b"b-solo"),
    );
    transport_sdk.on_receive(
        &link,
        receive_params(&link),
        frame(&producer_a, 1, 0b01, b"a-end"),
    );
    chan.manager.wait_for_callbacks().await;

    assert_eq!(
        received(&chan),
        vec![b"b-solo".to_vec(), b"a-start-a-end".to_vec()]
    );
}

#[tokio::test]
async fn empty_decode_result_is_cover_traffic() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;

    chan.harness
        .transport_sdk()
        .on_receive(&link, receive_params(&link), Vec::new());
    chan.manager.wait_for_callbacks().await;

    assert!(received(&chan).is_empty());
    assert!(chan.recorder.lock().unwrap().async_errors.is_empty());
}

#[tokio::test]
async fn truncated_frame_is_a_recoverable_error() {
    let chan = start_channel(EncodingMode::Batch).await;
    let link = create_link(&chan).await;
    let _conn = open_connection(&chan, &link).await;

    // promises 100 bytes, delivers 3
    let mut frame = Vec::new();
    put_u32(&mut frame, 100);
    frame.extend_from_slice(b"abc");
    chan.harness
        .transport_sdk()
        .on_receive(&link, receive_params(&link), frame);
    chan.manager.wait_for_callbacks().await;

    {
        let recorder = chan.recorder.lock().unwrap();
        assert!(recorder.received.is_empty());
        assert!(recorder.async_errors.contains(&PluginResponse::Error));
    }

    // the channel keeps working afterwards
    let mut ok_frame = Vec::new();
    put_block(&mut ok_frame, b"still alive");
    chan.harness
        .transport_sdk()
        .on_receive(&link, receive_params(&link), ok_frame);
    chan.manager.wait_for_callbacks().await;
    assert_eq!(received(&chan), vec![b"still alive".to_vec()]);
}

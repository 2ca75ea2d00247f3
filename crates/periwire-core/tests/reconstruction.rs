use periwire_core::protocol::{
    build_frame, ChecksumKind, Element, FrameError, MemoryChannel, MessageTemplate, Outcome,
    Reconstructor, TemplateBuilder, Transport,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn command_template() -> Arc<MessageTemplate> {
    Arc::new(
        TemplateBuilder::new(ChecksumKind::Xor)
            .element(Element::constant(&[0x02]).unchecked())
            .element(Element::data_length(1))
            .element(Element::fixed_data(1))
            .element(Element::variable_data())
            .element(Element::crc(1))
            .build()
            .unwrap(),
    )
}

fn length_template() -> Arc<MessageTemplate> {
    Arc::new(
        TemplateBuilder::new(ChecksumKind::None)
            .element(Element::data_length(1))
            .element(Element::variable_data())
            .build()
            .unwrap(),
    )
}

#[test]
fn test_partial_delivery_matches_whole_delivery() {
    let template = command_template();
    let frame = build_frame(&template, &[0x41, 1, 2, 3]).unwrap();
    assert_eq!(frame.len(), 7);

    let mut whole_channel = MemoryChannel::new();
    whole_channel.inject(&frame);
    let mut whole = Reconstructor::new(template.clone());
    let expected = whole.poll(&mut whole_channel);
    assert_eq!(expected, Outcome::Complete(vec![0x41, 1, 2, 3]));

    let mut channel = MemoryChannel::new();
    let mut partial = Reconstructor::new(template);
    channel.inject(&frame[..2]);
    assert_eq!(partial.poll(&mut channel), Outcome::Pending);
    channel.inject(&frame[2..3]);
    assert_eq!(partial.poll(&mut channel), Outcome::Pending);
    channel.inject(&frame[3..]);
    assert_eq!(partial.poll(&mut channel), expected);
}

#[test]
fn test_byte_at_a_time_delivery() {
    let template = command_template();
    let frame = build_frame(&template, &[0x50, 9, 8, 7, 6, 5]).unwrap();
    let mut channel = MemoryChannel::new();
    let mut reconstructor = Reconstructor::new(template);

    let (last, head) = frame.split_last().unwrap();
    for byte in head {
        channel.inject(&[*byte]);
        assert_eq!(reconstructor.poll(&mut channel), Outcome::Pending);
    }
    channel.inject(&[*last]);
    assert_eq!(
        reconstructor.poll(&mut channel),
        Outcome::Complete(vec![0x50, 9, 8, 7, 6, 5])
    );
}

#[test]
fn test_length_driven_resize() {
    let mut channel = MemoryChannel::new();
    channel.inject(&[5, 10, 20, 30, 40, 50]);
    let mut reconstructor = Reconstructor::new(length_template());
    assert_eq!(
        reconstructor.poll(&mut channel),
        Outcome::Complete(vec![10, 20, 30, 40, 50])
    );
}

#[test]
fn test_short_payload_times_out_to_idle() {
    let mut channel = MemoryChannel::new();
    channel.inject(&[5, 10, 20, 30]);
    let timeout = Duration::from_millis(50);
    let mut reconstructor = Reconstructor::new(length_template()).with_frame_timeout(timeout);

    let start = Instant::now();
    assert_eq!(reconstructor.poll_at(&mut channel, start), Outcome::Pending);
    assert_eq!(
        reconstructor.poll_at(&mut channel, start + Duration::from_millis(10)),
        Outcome::Pending
    );

    let outcome = reconstructor.poll_at(&mut channel, start + Duration::from_millis(80));
    assert!(matches!(outcome, Outcome::Resynced(FrameError::Timeout { .. })));
    assert!(reconstructor.is_idle());
    assert_eq!(channel.pending(), 0);
}

#[test]
fn test_blocking_receive_times_out_to_idle() {
    let mut channel = MemoryChannel::new();
    channel.inject(&[5, 10, 20, 30]);
    let mut reconstructor = Reconstructor::new(length_template());

    let result = reconstructor.receive(
        &mut channel,
        Duration::from_millis(30),
        Duration::from_millis(1),
    );
    assert!(matches!(result, Err(FrameError::Timeout { .. })));
    assert!(reconstructor.is_idle());
    assert_eq!(reconstructor.resyncs(), 1);
}

#[test]
fn test_blocking_receive_completes() {
    let mut channel = MemoryChannel::new();
    channel.inject(&[2, 0xAB, 0xCD]);
    let mut reconstructor = Reconstructor::new(length_template());
    let payload = reconstructor
        .receive(&mut channel, Duration::from_millis(100), Duration::from_millis(1))
        .unwrap();
    assert_eq!(payload, vec![0xAB, 0xCD]);
}

#[test]
fn test_recovers_after_corrupt_frame() {
    let template = command_template();
    let mut bad = build_frame(&template, &[0x41, 1]).unwrap();
    *bad.last_mut().unwrap() ^= 0x01;
    let good = build_frame(&template, &[0x42, 2]).unwrap();

    let mut channel = MemoryChannel::new();
    let mut reconstructor = Reconstructor::new(template);

    channel.inject(&bad);
    assert!(matches!(
        reconstructor.poll(&mut channel),
        Outcome::Resynced(FrameError::ChecksumMismatch { .. })
    ));
    assert_eq!(channel.input_flush_count(), 1);

    channel.inject(&good);
    assert_eq!(
        reconstructor.poll(&mut channel),
        Outcome::Complete(vec![0x42, 2])
    );
}

#[test]
fn test_closed_transport_is_discarded_not_raised() {
    let mut channel = MemoryChannel::new();
    channel.inject(&[5, 1]);
    let mut reconstructor = Reconstructor::new(length_template());
    assert_eq!(reconstructor.poll(&mut channel), Outcome::Pending);

    channel.close();
    assert!(matches!(
        reconstructor.poll(&mut channel),
        Outcome::Resynced(FrameError::Io(_))
    ));
    assert!(reconstructor.is_idle());
}

#[test]
fn test_expected_length_sizes_headerless_frames() {
    let template = Arc::new(
        TemplateBuilder::new(ChecksumKind::Xor)
            .element(Element::constant(&[0xFC]).unchecked())
            .element(Element::variable_data())
            .element(Element::crc(1))
            .expected_data_length(3)
            .build()
            .unwrap(),
    );
    let frame = build_frame(&template, &[1, 2, 3]).unwrap();
    let mut channel = MemoryChannel::new();
    channel.inject(&frame);
    let mut reconstructor = Reconstructor::new(template);
    assert_eq!(reconstructor.poll(&mut channel), Outcome::Complete(vec![1, 2, 3]));
}

#[test]
fn test_full_length_round_trip() {
    let template = Arc::new(
        TemplateBuilder::new(ChecksumKind::Xor)
            .element(Element::constant(&[0x7E]).unchecked())
            .element(Element::full_length(2).little_endian())
            .element(Element::fixed_data(1))
            .element(Element::variable_data())
            .element(Element::crc(1))
            .build()
            .unwrap(),
    );
    let payload = vec![0x30, 0xA0, 0xA1, 0xA2];
    let frame = build_frame(&template, &payload).unwrap();
    assert_eq!(&frame[1..3], &[frame.len() as u8, 0x00]);

    let mut channel = MemoryChannel::new();
    let mut reconstructor = Reconstructor::new(template);
    channel.inject(&frame[..4]);
    assert_eq!(reconstructor.poll(&mut channel), Outcome::Pending);
    channel.inject(&frame[4..]);
    assert_eq!(reconstructor.poll(&mut channel), Outcome::Complete(payload));
}

#[test]
fn test_length_plus_data_length_round_trip() {
    let template = Arc::new(
        TemplateBuilder::new(ChecksumKind::Crc32)
            .element(Element::length_plus_data_length(2))
            .element(Element::variable_data())
            .element(Element::crc(4))
            .build()
            .unwrap(),
    );

    for payload in [vec![0x01], vec![0x10, 0x20, 0x30, 0x40, 0x50]] {
        let frame = build_frame(&template, &payload).unwrap();
        assert_eq!(frame[1] as usize, payload.len() + 2);

        let mut channel = MemoryChannel::new();
        channel.inject(&frame);
        let mut reconstructor = Reconstructor::new(template.clone());
        assert_eq!(reconstructor.poll(&mut channel), Outcome::Complete(payload));
    }
}

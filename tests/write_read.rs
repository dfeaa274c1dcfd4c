use ctf_ir::*;
use pretty_assertions::assert_eq;
use test_log::test;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

const UUID_BYTES: [u8; 16] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0xFE,
];

/// A trace whose packet header is exactly `{ u32 magic; u8 uuid[16] }`.
fn magic_uuid_trace(byte_order: NativeByteOrder) -> (Trace, u64) {
    let mut trace = Trace::new();
    trace.set_native_byte_order(byte_order).unwrap();
    trace.set_uuid(Uuid::from_bytes(UUID_BYTES)).unwrap();

    let mut header = StructType::new();
    header
        .add_field("magic", IntegerType::new(32).unwrap().into())
        .unwrap();
    header
        .add_field(
            "uuid",
            ArrayType::new(IntegerType::new(8).unwrap().into(), 16).into(),
        )
        .unwrap();
    trace.set_packet_header_type(header.into()).unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class
        .add_event_class(EventClass::new("ev").unwrap())
        .unwrap();
    let id = trace.add_stream_class(stream_class).unwrap();
    (trace, id)
}

fn set_header_timestamp(event: &mut ctf_ir::event::Event, timestamp: u64) {
    event
        .header_mut()
        .unwrap()
        .as_struct_mut()
        .unwrap()
        .field_by_name("timestamp")
        .unwrap()
        .set_unsigned(timestamp)
        .unwrap();
}

#[test]
fn magic_and_uuid_lead_the_stream_file_big_endian() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, sc_id) = magic_uuid_trace(NativeByteOrder::BigEndian);

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    let mut event = trace.create_event(sc_id, "ev").unwrap();
    set_header_timestamp(&mut event, 0x0000_0001);
    stream.append_event(event).unwrap();
    stream.flush().unwrap();
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], &[0xC1, 0xFC, 0x1F, 0xC1]);
    assert_eq!(&bytes[4..20], &UUID_BYTES);

    let parser = Parser::new(&trace).unwrap();
    let packet = parser.parse(&mut bytes.as_slice()).unwrap();
    assert_eq!(packet.header.magic_number, Some(CTF_MAGIC_NUMBER));
    assert_eq!(packet.header.trace_uuid, Some(Uuid::from_bytes(UUID_BYTES)));
    assert_eq!(packet.events.len(), 1);
    assert_eq!(packet.events[0].timestamp, 1);
    assert_eq!(packet.events[0].name.as_str(), "ev");
}

#[test]
fn magic_respects_the_native_byte_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, sc_id) = magic_uuid_trace(NativeByteOrder::LittleEndian);

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    let mut event = trace.create_event(sc_id, "ev").unwrap();
    set_header_timestamp(&mut event, 1);
    stream.append_event(event).unwrap();
    stream.flush().unwrap();
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], &[0xC1, 0x1F, 0xFC, 0xC1]);
    assert_eq!(&bytes[4..20], &UUID_BYTES);
}

fn counter_trace() -> (Trace, u64) {
    let mut trace = Trace::new();
    trace
        .set_native_byte_order(NativeByteOrder::LittleEndian)
        .unwrap();
    let mut stream_class = StreamClass::new("chan");
    let mut event_class = EventClass::new("count").unwrap();
    event_class
        .add_field("value", IntegerType::new(32).unwrap().into())
        .unwrap();
    stream_class.add_event_class(event_class).unwrap();
    let id = trace.add_stream_class(stream_class).unwrap();
    (trace, id)
}

fn append_counter_event(trace: &Trace, stream: &mut Stream, sc_id: u64, ts: u64, value: u64) {
    let mut event = trace.create_event(sc_id, "count").unwrap();
    set_header_timestamp(&mut event, ts);
    event
        .payload_field("value")
        .unwrap()
        .set_unsigned(value)
        .unwrap();
    stream.append_event(event).unwrap();
}

#[test]
fn packets_carry_contexts_and_preserve_event_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, sc_id) = counter_trace();

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    for i in 0..3u64 {
        append_counter_event(&trace, &mut stream, sc_id, 10 + i, i);
    }
    stream.flush().unwrap();

    stream.append_discarded_events(2);
    for i in 3..5u64 {
        append_counter_event(&trace, &mut stream, sc_id, 10 + i, i);
    }
    stream.flush().unwrap();

    assert_eq!(stream.flushed_packet_count(), 2);
    assert_eq!(stream.last_timestamp_end(), Some(14));
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let bytes = std::fs::read(&path).unwrap();
    let parser = Parser::new(&trace).unwrap();
    let mut cursor = bytes.as_slice();

    let first = parser.parse(&mut cursor).unwrap();
    assert_eq!(first.context.beginning_timestamp, Some(10));
    assert_eq!(first.context.end_timestamp, Some(12));
    assert_eq!(first.context.events_discarded, Some(0));
    assert!(first.context.content_size_bits <= first.context.packet_size_bits);
    assert_eq!(first.context.packet_size_bits % 8, 0);
    assert_eq!(
        first
            .events
            .iter()
            .map(|e| e.payload[0].1.clone())
            .collect::<Vec<_>>(),
        vec![0u32.into(), 1u32.into(), 2u32.into()]
    );

    let second = parser.parse(&mut cursor).unwrap();
    assert_eq!(second.context.beginning_timestamp, Some(13));
    assert_eq!(second.context.end_timestamp, Some(14));
    assert_eq!(second.context.events_discarded, Some(2));
    assert_eq!(second.events.len(), 2);
    assert_eq!(second.events[0].timestamp, 13);
    assert_eq!(second.events[1].timestamp, 14);
}

#[test]
fn flushing_an_empty_stream_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, sc_id) = counter_trace();
    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    stream.flush().unwrap();
    assert_eq!(stream.flushed_packet_count(), 0);
    let path = dir.path().join(stream.name().as_str());
    drop(stream);
    assert_eq!(std::fs::read(&path).unwrap().len(), 0);
}

#[test]
fn compound_payload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut trace = Trace::new();
    trace
        .set_native_byte_order(NativeByteOrder::LittleEndian)
        .unwrap();

    let mut tag = EnumType::new(IntegerType::new(8).unwrap());
    tag.add_mapping("num", 0, 0).unwrap();
    tag.add_mapping("text", 1, 1).unwrap();

    let mut variant = VariantType::new("tag").unwrap();
    variant
        .add_option("num", IntegerType::new(32).unwrap().into())
        .unwrap();
    variant.add_option("text", StringType::new().into()).unwrap();

    let mut double = FloatType::new();
    double.set_exponent_digits(11).unwrap();
    double.set_mantissa_digits(53).unwrap();

    let mut event_class = EventClass::new("mixed").unwrap();
    event_class
        .add_field("len", IntegerType::new(32).unwrap().into())
        .unwrap();
    event_class
        .add_field(
            "data",
            SequenceType::new(IntegerType::new(8).unwrap().into(), "len")
                .unwrap()
                .into(),
        )
        .unwrap();
    event_class.add_field("tag", tag.into()).unwrap();
    event_class.add_field("v", variant.into()).unwrap();
    event_class.add_field("ratio", double.into()).unwrap();
    event_class.add_field("label", StringType::new().into()).unwrap();
    event_class
        .add_field(
            "grid",
            ArrayType::new(IntegerType::new(16).unwrap().into(), 4).into(),
        )
        .unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class.add_event_class(event_class).unwrap();
    let sc_id = trace.add_stream_class(stream_class).unwrap();

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    let mut event = trace.create_event(sc_id, "mixed").unwrap();
    set_header_timestamp(&mut event, 77);

    event.payload_field("len").unwrap().set_unsigned(4).unwrap();
    {
        let data = event
            .payload_field("data")
            .unwrap()
            .as_sequence_mut()
            .unwrap();
        data.set_length(4).unwrap();
        for i in 0..4 {
            data.field_at(i).unwrap().set_unsigned(0xF0 + i as u64).unwrap();
        }
    }
    event
        .payload_field("tag")
        .unwrap()
        .as_enum_mut()
        .unwrap()
        .container_mut()
        .set_unsigned(1)
        .unwrap();
    event
        .payload_field("v")
        .unwrap()
        .as_variant_mut()
        .unwrap()
        .set_tag_unsigned(1)
        .unwrap()
        .as_string_mut()
        .unwrap()
        .set("selected")
        .unwrap();
    event
        .payload_field("ratio")
        .unwrap()
        .as_float_mut()
        .unwrap()
        .set(0.1)
        .unwrap();
    event
        .payload_field("label")
        .unwrap()
        .as_string_mut()
        .unwrap()
        .set("céleste")
        .unwrap();
    {
        let grid = event.payload_field("grid").unwrap().as_array_mut().unwrap();
        for i in 0..4 {
            grid.field_at(i).unwrap().set_unsigned(1000 + i as u64).unwrap();
        }
    }

    stream.append_event(event).unwrap();
    stream.flush().unwrap();
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let bytes = std::fs::read(&path).unwrap();
    let parser = Parser::new(&trace).unwrap();
    let packet = parser.parse(&mut bytes.as_slice()).unwrap();
    assert_eq!(packet.events.len(), 1);

    let payload = &packet.events[0].payload;
    let by_name = |name: &str| {
        payload
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };

    assert_eq!(by_name("len"), 4u32.into());
    assert_eq!(
        by_name("data"),
        FieldValue::Array(vec![
            0xF0u8.into(),
            0xF1u8.into(),
            0xF2u8.into(),
            0xF3u8.into()
        ])
    );
    assert!(matches!(
        by_name("tag"),
        FieldValue::Enumeration(1, _, Some(label)) if label.as_str() == "text"
    ));
    assert!(matches!(
        by_name("v"),
        FieldValue::Variant(label, value)
            if label.as_str() == "text" && *value == FieldValue::String("selected".to_owned())
    ));
    assert_eq!(by_name("ratio"), 0.1f64.into());
    assert_eq!(by_name("label"), "céleste".into());
    assert_eq!(
        by_name("grid"),
        FieldValue::Array(vec![
            1000u16.into(),
            1001u16.into(),
            1002u16.into(),
            1003u16.into()
        ])
    );
}

#[test(tokio::test)]
async fn framed_async_read() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, sc_id) = counter_trace();

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    for i in 0..3u64 {
        append_counter_event(&trace, &mut stream, sc_id, i, i);
    }
    stream.flush().unwrap();
    for i in 3..6u64 {
        append_counter_event(&trace, &mut stream, sc_id, i, i);
    }
    stream.flush().unwrap();
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let parser = Parser::new(&trace).unwrap();
    let file = tokio::fs::File::open(&path).await.unwrap();
    let mut reader = FramedRead::new(file, parser.into_packet_decoder());

    let first = reader.next().await.unwrap().unwrap();
    assert_eq!(first.events.len(), 3);
    let second = reader.next().await.unwrap().unwrap();
    assert_eq!(second.events.len(), 3);
    assert!(reader.next().await.is_none());
}

use ctf_ir::*;
use test_log::test;

const EVENT_COUNT: usize = 10_000;
const WORDS_PER_EVENT: usize = 32;

/// Ten thousand events of `u64[32]` cannot fit the initial packet
/// allocation: the writer must grow the mapping, and the file must
/// read back as exactly the appended events, in order.
#[test]
fn packet_growth_preserves_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut trace = Trace::new();
    trace
        .set_native_byte_order(NativeByteOrder::LittleEndian)
        .unwrap();

    let mut event_class = EventClass::new("block").unwrap();
    event_class
        .add_field(
            "data",
            ArrayType::new(
                IntegerType::new(64).unwrap().into(),
                WORDS_PER_EVENT as u32,
            )
            .into(),
        )
        .unwrap();
    let mut stream_class = StreamClass::new("bulk");
    stream_class.add_event_class(event_class).unwrap();
    let sc_id = trace.add_stream_class(stream_class).unwrap();

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    for i in 0..EVENT_COUNT {
        let mut event = trace.create_event(sc_id, "block").unwrap();
        event
            .header_mut()
            .unwrap()
            .as_struct_mut()
            .unwrap()
            .field_by_name("timestamp")
            .unwrap()
            .set_unsigned(i as u64)
            .unwrap();
        let data = event.payload_field("data").unwrap().as_array_mut().unwrap();
        for j in 0..WORDS_PER_EVENT {
            data.field_at(j)
                .unwrap()
                .set_unsigned((i * WORDS_PER_EVENT + j) as u64)
                .unwrap();
        }
        stream.append_event(event).unwrap();
    }
    stream.flush().unwrap();
    let path = dir.path().join(stream.name().as_str());
    drop(stream);

    let bytes = std::fs::read(&path).unwrap();
    // The payload alone is 2.56 MB: far beyond one growth increment,
    // so the mapping was enlarged at least once.
    assert!(bytes.len() > EVENT_COUNT * WORDS_PER_EVENT * 8);

    let parser = Parser::new(&trace).unwrap();
    let packet = parser.parse(&mut bytes.as_slice()).unwrap();
    assert_eq!(packet.events.len(), EVENT_COUNT);
    assert!(packet.context.content_size_bits <= packet.context.packet_size_bits);
    assert_eq!(packet.context.packet_size_bits, bytes.len() * 8);

    for (i, event) in packet.events.iter().enumerate() {
        assert_eq!(event.timestamp, i as u64);
    }
    for i in [0, EVENT_COUNT / 2, EVENT_COUNT - 1] {
        let (name, value) = &packet.events[i].payload[0];
        assert_eq!(name.as_str(), "data");
        let expected = FieldValue::Array(
            (0..WORDS_PER_EVENT)
                .map(|j| ((i * WORDS_PER_EVENT + j) as u64).into())
                .collect(),
        );
        assert_eq!(value, &expected);
    }
}

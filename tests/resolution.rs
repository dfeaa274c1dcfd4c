use ctf_ir::*;
use test_log::test;

fn u8_type() -> FieldType {
    IntegerType::new(8).unwrap().into()
}

fn u32_type() -> FieldType {
    IntegerType::new(32).unwrap().into()
}

/// Packet context `{ u32 len; u8 data[len] }`: the length precedes the
/// data, so attachment resolves and a populated context flushes.
#[test]
fn sequence_length_before_data_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let mut trace = Trace::new();
    trace
        .set_native_byte_order(NativeByteOrder::LittleEndian)
        .unwrap();

    let mut context = StructType::new();
    context.add_field("len", u32_type()).unwrap();
    context
        .add_field("data", SequenceType::new(u8_type(), "len").unwrap().into())
        .unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class.set_packet_context_type(context.into()).unwrap();
    stream_class
        .add_event_class(EventClass::new("ev").unwrap())
        .unwrap();
    let sc_id = trace.add_stream_class(stream_class).unwrap();

    let mut stream = trace.create_stream(sc_id, dir.path()).unwrap();
    {
        let context = stream.packet_context_mut().as_struct_mut().unwrap();
        context.field_by_name("len").unwrap().set_unsigned(4).unwrap();
        let data = context
            .field_by_name("data")
            .unwrap()
            .as_sequence_mut()
            .unwrap();
        data.set_length(4).unwrap();
        for i in 0..4 {
            data.field_at(i).unwrap().set_unsigned(i as u64).unwrap();
        }
    }

    let mut event = trace.create_event(sc_id, "ev").unwrap();
    event
        .header_mut()
        .unwrap()
        .as_struct_mut()
        .unwrap()
        .field_by_name("timestamp")
        .unwrap()
        .set_unsigned(0)
        .unwrap();
    stream.append_event(event).unwrap();
    stream.flush().unwrap();
}

/// Reversing the declaration order must fail resolution: a field may
/// only reference a field that precedes it.
#[test]
fn sequence_data_before_length_fails() {
    let mut trace = Trace::new();

    let mut context = StructType::new();
    context
        .add_field("data", SequenceType::new(u8_type(), "len").unwrap().into())
        .unwrap();
    context.add_field("len", u32_type()).unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class.set_packet_context_type(context.into()).unwrap();

    let err = trace.add_stream_class(stream_class).unwrap_err();
    assert!(matches!(err, Error::PathResolution(_)));
}

/// A variant whose tag is a plain integer (not an enumeration) must be
/// rejected at attachment time.
#[test]
fn variant_tag_must_be_an_enumeration() {
    let mut trace = Trace::new();

    let mut variant = VariantType::new("tag").unwrap();
    variant.add_option("a", u32_type()).unwrap();
    variant.add_option("b", StringType::new().into()).unwrap();

    let mut event_class = EventClass::new("ev").unwrap();
    event_class.add_field("tag", u32_type()).unwrap();
    event_class.add_field("v", variant.into()).unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class.add_event_class(event_class).unwrap();

    let err = trace.add_stream_class(stream_class).unwrap_err();
    assert!(matches!(err, Error::PathResolution(_)));
    assert!(err.to_string().contains("not an enumeration"));
}

/// A payload variant may be keyed by an enumeration living in the
/// event header (a previous scope).
#[test]
fn payload_variant_keyed_by_header_enumeration() {
    let mut trace = Trace::new();

    let mut selector = EnumType::new(IntegerType::new(8).unwrap());
    selector.add_mapping("a", 0, 0).unwrap();
    let mut header = StructType::new();
    header.add_field("id", u32_type()).unwrap();
    header
        .add_field("timestamp", IntegerType::new(64).unwrap().into())
        .unwrap();
    header.add_field("sel", selector.into()).unwrap();

    let mut variant = VariantType::new("sel").unwrap();
    variant.add_option("a", u32_type()).unwrap();
    let mut event_class = EventClass::new("ev").unwrap();
    event_class.add_field("v", variant.into()).unwrap();

    let mut stream_class = StreamClass::new("chan");
    stream_class.set_event_header_type(header.into()).unwrap();
    stream_class.add_event_class(event_class).unwrap();

    let sc_id = trace.add_stream_class(stream_class).unwrap();
    let ec = trace.stream_class(sc_id).unwrap().event_class_by_id(0).unwrap();
    let variant = ec
        .payload_type()
        .unwrap()
        .child_at(0)
        .unwrap()
        .as_variant()
        .unwrap();
    let path = variant.tag_field_path().unwrap();
    assert_eq!(path.root, Scope::StreamEventHeader);
    assert_eq!(path.indexes, vec![2]);

    // The resolved target exists and is an enumeration.
    let target = trace.field_type_at(sc_id, Some(0), path).unwrap();
    assert!(target.as_enum().is_some());
}

/// Sequences falling back to a previous scope are permitted by default
/// and can be disabled through the resolver options.
#[test]
fn previous_scope_sequences_are_configurable() {
    let build = || {
        let mut context = StructType::new();
        context.add_field("len", u32_type()).unwrap();

        let mut event_class = EventClass::new("ev").unwrap();
        event_class
            .add_field("data", SequenceType::new(u8_type(), "len").unwrap().into())
            .unwrap();

        let mut stream_class = StreamClass::new("chan");
        stream_class.set_packet_context_type(context.into()).unwrap();
        stream_class.add_event_class(event_class).unwrap();
        stream_class
    };

    let mut permissive = Trace::new();
    permissive.add_stream_class(build()).unwrap();

    let mut strict = Trace::new();
    strict.set_resolve_options(schema::resolve::ResolveOptions {
        allow_previous_scope_sequences: false,
    });
    let err = strict.add_stream_class(build()).unwrap_err();
    assert!(matches!(err, Error::PathResolution(_)));
}

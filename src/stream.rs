use crate::{
    clock::{apply_cycle_wrap, ClockClass},
    error::Error,
    event::{Event, EventClass},
    field::Field,
    schema::{FieldType, IntegerType, NativeByteOrder, StructType},
    types::CTF_MAGIC_NUMBER,
    writer::{serialize_event, serialize_field, StreamPosition},
};
use byteordered::Endianness;
use fxhash::FxHashMap;
use internment::Intern;
use std::{
    fs::OpenOptions,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    sync::Arc,
};
use tracing::debug;
use uuid::Uuid;

fn u64_type() -> FieldType {
    IntegerType::new(64).expect("valid size").into()
}

/// The default packet context: the five well-known fields flush can
/// populate automatically.
fn default_packet_context_type() -> FieldType {
    let mut st = StructType::new();
    st.add_field("timestamp_begin", u64_type()).expect("fresh structure");
    st.add_field("timestamp_end", u64_type()).expect("fresh structure");
    st.add_field("content_size", u64_type()).expect("fresh structure");
    st.add_field("packet_size", u64_type()).expect("fresh structure");
    st.add_field("events_discarded", u64_type()).expect("fresh structure");
    st.into()
}

/// The default event header: event class id and timestamp.
fn default_event_header_type() -> FieldType {
    let mut st = StructType::new();
    st.add_field("id", IntegerType::new(32).expect("valid size").into())
        .expect("fresh structure");
    st.add_field("timestamp", u64_type()).expect("fresh structure");
    st.into()
}

/// The class of a data stream: per-stream scope field types and the
/// set of event classes. Created with default packet-context and
/// event-header types which may be replaced before the class is added
/// to a trace.
#[derive(Clone, Debug)]
pub struct StreamClass {
    pub(crate) frozen: bool,
    pub(crate) id: Option<u64>,
    pub(crate) name: Intern<String>,
    pub(crate) clock: Option<Arc<ClockClass>>,
    pub(crate) packet_context_type: Option<Arc<FieldType>>,
    pub(crate) event_header_type: Option<Arc<FieldType>>,
    pub(crate) event_context_type: Option<Arc<FieldType>>,
    pub(crate) event_classes: Vec<Arc<EventClass>>,
    pub(crate) next_event_class_id: u64,
}

impl StreamClass {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            frozen: false,
            id: None,
            name: Intern::new(name.into()),
            clock: None,
            packet_context_type: Some(Arc::new(default_packet_context_type())),
            event_header_type: Some(Arc::new(default_event_header_type())),
            event_context_type: None,
            event_classes: Vec::new(),
            next_event_class_id: 0,
        }
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    /// The id assigned when this class was added to a trace.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn clock(&self) -> Option<&Arc<ClockClass>> {
        self.clock.as_ref()
    }

    pub fn packet_context_type(&self) -> Option<&Arc<FieldType>> {
        self.packet_context_type.as_ref()
    }

    pub fn event_header_type(&self) -> Option<&Arc<FieldType>> {
        self.event_header_type.as_ref()
    }

    pub fn event_context_type(&self) -> Option<&Arc<FieldType>> {
        self.event_context_type.as_ref()
    }

    pub fn event_classes(&self) -> &[Arc<EventClass>] {
        &self.event_classes
    }

    pub fn event_class_by_id(&self, id: u64) -> Option<&Arc<EventClass>> {
        self.event_classes.iter().find(|ec| ec.id() == Some(id))
    }

    pub fn event_class_by_name(&self, name: &str) -> Option<&Arc<EventClass>> {
        self.event_classes
            .iter()
            .find(|ec| ec.name().as_str() == name)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("stream class"))
        } else {
            Ok(())
        }
    }

    pub fn set_clock(&mut self, clock: Arc<ClockClass>) -> Result<(), Error> {
        self.check_frozen()?;
        self.clock = Some(clock);
        Ok(())
    }

    pub fn set_packet_context_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.packet_context_type = Some(Arc::new(ty));
        Ok(())
    }

    pub fn set_event_header_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.event_header_type = Some(Arc::new(ty));
        Ok(())
    }

    pub fn set_event_context_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.event_context_type = Some(Arc::new(ty));
        Ok(())
    }

    /// Adds an event class and assigns its id within this stream
    /// class. Adding to an already attached (frozen) class goes
    /// through [`crate::Trace::add_event_class`] instead.
    pub fn add_event_class(&mut self, mut event_class: EventClass) -> Result<u64, Error> {
        self.check_frozen()?;
        let id = self.next_event_class_id;
        event_class.id = Some(id);
        self.next_event_class_id += 1;
        self.event_classes.push(Arc::new(event_class));
        Ok(id)
    }
}

/// A writable data stream: one file, a rolling packet buffer, queued
/// events, and the packet header/context fields. Flushing commits all
/// queued events as exactly one CTF packet.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    class_id: u64,
    name: Intern<String>,
    byte_order: NativeByteOrder,
    packet_header: Field,
    packet_context: Field,
    events: Vec<Event>,
    pos: StreamPosition,
    flushed_packet_count: u32,
    discarded_events: u64,
    last_timestamp_end: Option<u64>,
    clock_values: FxHashMap<Intern<String>, u64>,
}

impl Stream {
    pub(crate) fn create(
        directory: &Path,
        stream_id: u64,
        class: &StreamClass,
        byte_order: NativeByteOrder,
        packet_header_type: Arc<FieldType>,
        trace_uuid: Uuid,
    ) -> Result<Self, Error> {
        let class_id = class
            .id()
            .ok_or_else(|| Error::invalid("stream class is not attached to a trace"))?;
        let packet_context_type = class
            .packet_context_type
            .clone()
            .ok_or_else(|| Error::invalid("stream class has no packet context type"))?;

        let file_name = if class.name().is_empty() {
            format!("stream_{class_id}_{stream_id}")
        } else {
            format!("{}_{stream_id}", class.name())
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(directory.join(&file_name))?;
        debug!(file = %file_name, stream_id, class_id, "Created stream file");

        let mut packet_header = Field::from_arc(packet_header_type);
        set_packet_header_magic(&mut packet_header)?;
        set_packet_header_uuid(&mut packet_header, trace_uuid)?;
        set_packet_header_stream_id(&mut packet_header, class_id)?;

        let mut packet_context = Field::from_arc(packet_context_type);
        set_structure_field_integer(&mut packet_context, "events_discarded", 0)?;

        Ok(Self {
            id: stream_id,
            class_id,
            name: Intern::new(file_name),
            byte_order,
            packet_header,
            packet_context,
            events: Vec::new(),
            pos: StreamPosition::new(file),
            flushed_packet_count: 0,
            discarded_events: 0,
            last_timestamp_end: None,
            clock_values: FxHashMap::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_class_id(&self) -> u64 {
        self.class_id
    }

    /// The stream file's name within the trace directory.
    pub fn name(&self) -> Intern<String> {
        self.name
    }

    pub fn flushed_packet_count(&self) -> u32 {
        self.flushed_packet_count
    }

    pub fn queued_event_count(&self) -> usize {
        self.events.len()
    }

    pub fn discarded_event_count(&self) -> u64 {
        self.discarded_events
    }

    pub fn append_discarded_events(&mut self, count: u64) {
        self.discarded_events = self.discarded_events.saturating_add(count);
    }

    /// Timestamp written as `timestamp_end` of the last flushed packet.
    pub fn last_timestamp_end(&self) -> Option<u64> {
        self.last_timestamp_end
    }

    /// Accumulated value of the named clock, as updated by appended
    /// event headers.
    pub fn clock_value(&self, clock_name: &str) -> Option<u64> {
        self.clock_values
            .get(&Intern::new(clock_name.to_owned()))
            .copied()
    }

    pub fn packet_header(&self) -> &Field {
        &self.packet_header
    }

    pub fn packet_header_mut(&mut self) -> &mut Field {
        &mut self.packet_header
    }

    pub fn packet_context(&self) -> &Field {
        &self.packet_context
    }

    pub fn packet_context_mut(&mut self) -> &mut Field {
        &mut self.packet_context
    }

    /// Queues a validated event for the next packet.
    ///
    /// The event header's `id` field is populated from the event class
    /// when present and unset. Integer header fields mapped to a clock
    /// update the per-stream clock ledger with cycle-wrap tracking; a
    /// mapped, unset `timestamp` field is populated from the ledger.
    pub fn append_event(&mut self, mut event: Event) -> Result<(), Error> {
        let class_id = event.event_class().id().unwrap_or(0);

        if let Some(header) = event.header_mut() {
            set_structure_field_integer(header, "id", class_id)?;
            self.update_header_clocks(header)?;
        }

        event.validate()?;
        event.freeze();
        self.events.push(event);
        Ok(())
    }

    /// Applies the CTF cycle-wrap rules for every top-level integer
    /// header field mapped to a clock, filling unset ones from the
    /// ledger.
    fn update_header_clocks(&mut self, header: &mut Field) -> Result<(), Error> {
        let Some(s) = header.as_struct_mut() else {
            return Ok(());
        };
        for index in 0..s.field_count() {
            let (clock_name, size) = {
                let Some(member) = s.struct_type().member_at(index) else {
                    break;
                };
                let Some(int_ty) = member.ty.as_integer() else {
                    continue;
                };
                let Some(clock) = int_ty.mapped_clock() else {
                    continue;
                };
                if int_ty.is_signed() {
                    continue;
                }
                (clock.name(), int_ty.size())
            };

            let field = s.field_at(index)?;
            let int = field.as_integer_mut().expect("integer member");
            if int.is_set() {
                let snapshot = int.raw_bits();
                let accumulated = match self.clock_values.get(&clock_name) {
                    Some(current) => apply_cycle_wrap(*current, snapshot, size),
                    // First value observed for this clock: register it
                    // as the initial accumulated value.
                    None => snapshot,
                };
                self.clock_values.insert(clock_name, accumulated);
            } else if let Some(accumulated) = self.clock_values.get(&clock_name) {
                int.set_raw_bits(*accumulated);
            }
        }
        Ok(())
    }

    /// Commits all queued events as one CTF packet. A stream with no
    /// queued events flushes to nothing.
    ///
    /// On failure the current packet is marked aborted so the next
    /// flush overwrites the partial bytes.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.events.is_empty() {
            return Ok(());
        }
        match self.flush_packet() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pos.poison();
                Err(e)
            }
        }
    }

    fn flush_packet(&mut self) -> Result<(), Error> {
        let native: Endianness = self.byte_order.into();

        self.packet_header.validate()?;

        // mmap the next packet
        self.pos.next_packet()?;
        serialize_field(&self.packet_header, &mut self.pos, native)?;

        // Set the default context attributes if present and unset.
        if let Some(begin) = self.events.first().and_then(event_header_timestamp) {
            set_structure_field_integer(&mut self.packet_context, "timestamp_begin", begin)?;
        }
        let timestamp_end = self.events.last().and_then(event_header_timestamp);
        if let Some(end) = timestamp_end {
            set_structure_field_integer(&mut self.packet_context, "timestamp_end", end)?;
        }
        // Size placeholders, rewritten once the real sizes are known.
        set_structure_field_integer(&mut self.packet_context, "content_size", u64::MAX)?;
        set_structure_field_integer(&mut self.packet_context, "packet_size", u64::MAX)?;
        set_structure_field_integer(
            &mut self.packet_context,
            "events_discarded",
            self.discarded_events,
        )?;

        // Keep a rewind snapshot for the placeholder rewrite.
        let context_offset = self.pos.offset_bits();
        serialize_field(&self.packet_context, &mut self.pos, native)?;

        for event in self.events.iter() {
            serialize_event(event, &mut self.pos, native)?;
        }

        // Rewrite the size placeholders at the snapshot. The mapping
        // may have moved since (packet growth); the position always
        // holds the current one.
        let content_size = self.pos.offset_bits();
        let packet_size = self.pos.packet_size_bits();
        overwrite_structure_field_integer(&mut self.packet_context, "content_size", content_size)?;
        overwrite_structure_field_integer(&mut self.packet_context, "packet_size", packet_size)?;
        overwrite_structure_field_integer(
            &mut self.packet_context,
            "events_discarded",
            self.discarded_events,
        )?;
        self.pos.set_offset_bits(context_offset);
        serialize_field(&self.packet_context, &mut self.pos, native)?;
        self.pos.set_offset_bits(content_size);

        debug!(
            packet = self.flushed_packet_count,
            content_size, packet_size, "Flushed packet"
        );

        // Start the next packet's context fresh, carrying only the
        // discarded-event counter snapshot.
        self.packet_context.reset();
        set_structure_field_integer(
            &mut self.packet_context,
            "events_discarded",
            self.discarded_events,
        )?;
        self.last_timestamp_end = timestamp_end;
        self.events.clear();
        self.flushed_packet_count += 1;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Truncate the file to the last successful packet's end byte.
        self.pos.finalize();
    }
}

/// Reads the unsigned value of the event header's `timestamp` field,
/// if present and set.
fn event_header_timestamp(event: &Event) -> Option<u64> {
    let s = event.header()?.as_struct()?;
    match s.peek_field("timestamp")? {
        Field::Integer(int) if int.is_set() => {
            if int.integer_type().is_signed() {
                int.signed_value().ok().map(|v| v as u64)
            } else {
                int.unsigned_value().ok()
            }
        }
        _ => None,
    }
}

/// Sets an integer member of a structure field, when the member exists
/// and is unset. A missing member is not an error; a non-integer
/// member is: the caller meant it to be populated automatically.
fn set_structure_field_integer(field: &mut Field, name: &str, value: u64) -> Result<(), Error> {
    let Some(s) = field.as_struct_mut() else {
        return Ok(());
    };
    let Some(index) = s.struct_type().field_index(name) else {
        // Field not found, not an error.
        return Ok(());
    };
    let field = s.field_at(index)?;
    let Field::Integer(int) = field else {
        return Err(Error::invalid(format!(
            "field '{name}' is expected to be an integer"
        )));
    };
    if int.is_set() {
        // Payload already set, not an error.
        return Ok(());
    }
    if int.integer_type().is_signed() {
        int.set_signed(value as i64)
    } else {
        int.set_unsigned(value)
    }
}

/// Force-writes an integer member, replacing any previous value.
fn overwrite_structure_field_integer(
    field: &mut Field,
    name: &str,
    value: u64,
) -> Result<(), Error> {
    let Some(s) = field.as_struct_mut() else {
        return Ok(());
    };
    let Some(index) = s.struct_type().field_index(name) else {
        return Ok(());
    };
    let field = s.field_at(index)?;
    field.reset();
    set_field_integer(field, name, value)
}

fn set_field_integer(field: &mut Field, name: &str, value: u64) -> Result<(), Error> {
    let Field::Integer(int) = field else {
        return Err(Error::invalid(format!(
            "field '{name}' is expected to be an integer"
        )));
    };
    if int.integer_type().is_signed() {
        int.set_signed(value as i64)
    } else {
        int.set_unsigned(value)
    }
}

/// Populates the packet header's `magic` field when it is an unset
/// 32-bit integer; anything else is skipped silently.
fn set_packet_header_magic(header: &mut Field) -> Result<(), Error> {
    let Some(s) = header.as_struct_mut() else {
        return Ok(());
    };
    let Some(index) = s.struct_type().field_index("magic") else {
        return Ok(());
    };
    let field = s.field_at(index)?;
    let Field::Integer(int) = field else {
        return Ok(());
    };
    if int.is_set() || int.integer_type().size() != 32 {
        return Ok(());
    }
    if int.integer_type().is_signed() {
        int.set_signed(CTF_MAGIC_NUMBER as i32 as i64)
    } else {
        int.set_unsigned(u64::from(CTF_MAGIC_NUMBER))
    }
}

/// Populates the packet header's `stream_id` field when it is an
/// unset integer; anything else is skipped silently.
fn set_packet_header_stream_id(header: &mut Field, stream_class_id: u64) -> Result<(), Error> {
    let Some(s) = header.as_struct_mut() else {
        return Ok(());
    };
    let Some(index) = s.struct_type().field_index("stream_id") else {
        return Ok(());
    };
    let field = s.field_at(index)?;
    let Field::Integer(int) = field else {
        return Ok(());
    };
    if int.is_set() {
        return Ok(());
    }
    if int.integer_type().is_signed() {
        int.set_signed(stream_class_id as i64)
    } else {
        int.set_unsigned(stream_class_id)
    }
}

/// Populates the packet header's `uuid` field when it is an unset
/// 16-element array of 8-bit integers.
fn set_packet_header_uuid(header: &mut Field, uuid: Uuid) -> Result<(), Error> {
    let Some(s) = header.as_struct_mut() else {
        return Ok(());
    };
    let Some(index) = s.struct_type().field_index("uuid") else {
        return Ok(());
    };
    let field = s.field_at(index)?;
    if field.validate().is_ok() {
        // Value already set. Not an error, skip.
        return Ok(());
    }
    let Some(array) = field.as_array_mut() else {
        return Ok(());
    };
    if array.length() != 16 {
        return Ok(());
    }
    for (index, byte) in uuid.as_bytes().iter().enumerate() {
        let element = array.field_at(index)?;
        let Field::Integer(int) = element else {
            return Ok(());
        };
        if int.integer_type().size() != 8 {
            return Ok(());
        }
        if int.integer_type().is_signed() {
            int.set_signed(*byte as i8 as i64)?;
        } else {
            int.set_unsigned(u64::from(*byte))?;
        }
    }
    Ok(())
}

use self::types::FieldDecoder;
use crate::{
    error::Error,
    field::Field,
    schema::{FieldType, NativeByteOrder, Scope},
    trace::Trace,
    types::{
        decode_members, Event, EventId, FieldValue, LogLevel, Packet, PacketContext, PacketHeader,
    },
};
use bytes::{Buf, BytesMut};
use fxhash::FxHashMap;
use internment::Intern;
use std::{io::Read, sync::Arc};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) mod types;

/// Well-known packet context member names extracted into
/// [`PacketContext`]; anything else lands in `extra_members`.
const WELL_KNOWN_CONTEXT_MEMBERS: [&str; 6] = [
    "timestamp_begin",
    "timestamp_end",
    "content_size",
    "packet_size",
    "events_discarded",
    "packet_seq_num",
];

/// A CTF packet-stream parser built from a trace's attached (resolved
/// and frozen) schema.
#[derive(Debug)]
pub struct Parser {
    byte_order: NativeByteOrder,
    trace_uuid: Option<Uuid>,
    packet_header_type: Option<Arc<FieldType>>,
    streams: FxHashMap<u64, StreamSchema>,
}

#[derive(Debug)]
struct StreamSchema {
    stream_name: Intern<String>,
    clock_name: Option<Intern<String>>,
    packet_context_type: Option<Arc<FieldType>>,
    event_header_type: Option<Arc<FieldType>>,
    common_context_type: Option<Arc<FieldType>>,
    events: FxHashMap<EventId, EventSchema>,
}

#[derive(Debug)]
struct EventSchema {
    event_name: Intern<String>,
    log_level: Option<LogLevel>,
    specific_context_type: Option<Arc<FieldType>>,
    payload_type: Option<Arc<FieldType>>,
}

impl Parser {
    pub fn new(trace: &Trace) -> Result<Self, Error> {
        let byte_order = trace
            .native_byte_order()
            .ok_or_else(|| Error::validation("trace native byte order is unspecified"))?;

        let mut streams = FxHashMap::default();
        for sc in trace.stream_classes() {
            let stream_id = sc
                .id()
                .ok_or_else(|| Error::invalid("stream class is not attached"))?;
            let mut events = FxHashMap::default();
            for ec in sc.event_classes() {
                events.insert(
                    ec.id().ok_or_else(|| Error::invalid("event class has no id"))?,
                    EventSchema {
                        event_name: ec.name(),
                        log_level: ec.log_level(),
                        specific_context_type: ec.context_type().cloned(),
                        payload_type: ec.payload_type().cloned(),
                    },
                );
            }
            streams.insert(
                stream_id,
                StreamSchema {
                    stream_name: sc.name(),
                    clock_name: sc.clock().map(|c| c.name()),
                    packet_context_type: sc.packet_context_type().cloned(),
                    event_header_type: sc.event_header_type().cloned(),
                    common_context_type: sc.event_context_type().cloned(),
                    events,
                },
            );
        }

        Ok(Self {
            byte_order,
            trace_uuid: Some(trace.uuid()),
            packet_header_type: trace.packet_header_type().cloned(),
            streams,
        })
    }

    pub fn into_packet_decoder(self) -> PacketDecoder {
        PacketDecoder { parser: self }
    }

    /// Reads one packet: header, context, and all event records up to
    /// the content size, then skips the padding to the packet size.
    pub fn parse<R: Read>(&self, r: &mut R) -> Result<Packet, Error> {
        let mut decoder = FieldDecoder::new(r, self.byte_order.into());

        let header = self.parse_header(&mut decoder)?;

        // Stream-specific from here on
        let stream = self
            .streams
            .get(&header.stream_id)
            .ok_or(Error::UndefinedStreamId(header.stream_id))?;

        let context = Self::parse_packet_context(stream, &mut decoder)?;

        let events = Self::parse_events(stream, &context, &mut decoder)?;

        Ok(Packet {
            header,
            context,
            events,
        })
    }

    fn parse_header<R: Read>(&self, decoder: &mut FieldDecoder<R>) -> Result<PacketHeader, Error> {
        let header_field = self
            .packet_header_type
            .as_ref()
            .map(|ty| decoder.decode_scope(Scope::TracePacketHeader, ty))
            .transpose()?;

        let magic = structure_uint(header_field.as_ref(), "magic").map(|v| v as u32);
        let trace_uuid = structure_uuid(header_field.as_ref());
        let stream_id = structure_uint(header_field.as_ref(), "stream_id").unwrap_or(0);
        debug!(stream_id, ?magic, ?trace_uuid, "Parsed packet header");

        if let Some(m) = magic {
            if m != PacketHeader::MAGIC {
                warn!(
                    "Invalid packet header magic number 0x{m:X} (expected 0x{:X})",
                    PacketHeader::MAGIC
                );
            }
        }
        if let (Some(uuid), Some(trace_uuid)) = (trace_uuid.as_ref(), self.trace_uuid.as_ref()) {
            if uuid != trace_uuid {
                warn!(packet_uuid = %uuid, %trace_uuid, "Trace UUID doesn't match");
            }
        }

        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(Error::UndefinedStreamId(stream_id))?;

        Ok(PacketHeader {
            magic_number: magic,
            trace_uuid,
            stream_id,
            stream_name: stream.stream_name,
            clock_name: stream.clock_name,
        })
    }

    fn parse_packet_context<R: Read>(
        stream: &StreamSchema,
        decoder: &mut FieldDecoder<R>,
    ) -> Result<PacketContext, Error> {
        let context_field = stream
            .packet_context_type
            .as_ref()
            .map(|ty| decoder.decode_scope(Scope::StreamPacketContext, ty))
            .transpose()?;

        let content_size_bits = structure_uint(context_field.as_ref(), "content_size")
            .ok_or_else(|| Error::validation("packet context has no content_size field"))?
            as usize;
        let packet_size_bits = structure_uint(context_field.as_ref(), "packet_size")
            .ok_or_else(|| Error::validation("packet context has no packet_size field"))?
            as usize;
        if packet_size_bits % 8 != 0 || content_size_bits > packet_size_bits {
            return Err(Error::validation(format!(
                "inconsistent packet sizes (content {content_size_bits}, packet {packet_size_bits})"
            )));
        }

        let beginning_timestamp = structure_uint(context_field.as_ref(), "timestamp_begin");
        let end_timestamp = structure_uint(context_field.as_ref(), "timestamp_end");
        let events_discarded = structure_uint(context_field.as_ref(), "events_discarded");
        let sequence_number = structure_uint(context_field.as_ref(), "packet_seq_num");

        let mut extra_members = Vec::new();
        if let Some(s) = context_field.as_ref().and_then(|f| f.as_struct()) {
            for index in 0..s.field_count() {
                let member = s.struct_type().member_at(index).expect("in range");
                if WELL_KNOWN_CONTEXT_MEMBERS.contains(&member.name.as_str()) {
                    continue;
                }
                let child = s.peek_at(index).ok_or_else(|| {
                    Error::validation(format!("field '{}' was not decoded", member.name))
                })?;
                extra_members.push((member.name, FieldValue::from_field(child)?));
            }
        }

        debug!(
            packet_size = packet_size_bits,
            content_size = content_size_bits,
            ?events_discarded,
            ?sequence_number,
            "Parsed packet context"
        );

        Ok(PacketContext {
            packet_size_bits,
            content_size_bits,
            beginning_timestamp,
            end_timestamp,
            events_discarded,
            sequence_number,
            extra_members,
        })
    }

    fn parse_events<R: Read>(
        stream: &StreamSchema,
        packet_context: &PacketContext,
        decoder: &mut FieldDecoder<R>,
    ) -> Result<Vec<Event>, Error> {
        let mut events = Vec::new();

        // Read until we reach the end of the actual packet content
        while decoder.cursor_bits() < packet_context.content_size_bits as u64 {
            let before = decoder.cursor_bits();

            let header_field = stream
                .event_header_type
                .as_ref()
                .map(|ty| decoder.decode_scope(Scope::StreamEventHeader, ty))
                .transpose()?;
            let event_id = structure_uint(header_field.as_ref(), "id").unwrap_or(0);
            let timestamp = structure_uint(header_field.as_ref(), "timestamp").unwrap_or(0);
            debug!(event_id, timestamp, "Parsed event header");

            let common_context_field = stream
                .common_context_type
                .as_ref()
                .map(|ty| decoder.decode_scope(Scope::StreamEventContext, ty))
                .transpose()?;

            // Event-specific from here on
            let event = stream
                .events
                .get(&event_id)
                .ok_or(Error::UndefinedEventId(event_id))?;

            let specific_context_field = event
                .specific_context_type
                .as_ref()
                .map(|ty| decoder.decode_scope(Scope::EventContext, ty))
                .transpose()?;

            let payload_field = event
                .payload_type
                .as_ref()
                .map(|ty| decoder.decode_scope(Scope::EventPayload, ty))
                .transpose()?;

            events.push(Event {
                id: event_id,
                name: event.event_name,
                timestamp,
                log_level: event.log_level,
                common_context: decode_members(
                    stream.common_context_type.as_ref(),
                    common_context_field.as_ref(),
                )?,
                specific_context: decode_members(
                    event.specific_context_type.as_ref(),
                    specific_context_field.as_ref(),
                )?,
                payload: decode_members(event.payload_type.as_ref(), payload_field.as_ref())?,
            });

            if decoder.cursor_bits() == before {
                return Err(Error::validation(
                    "event record decoding made no progress",
                ));
            }
        }

        // Skip the padding up to the declared packet size
        let remaining_bits = (packet_context.packet_size_bits as u64)
            .checked_sub(decoder.cursor_bits())
            .ok_or_else(|| {
                Error::validation("event records overran the declared packet size")
            })?;
        decoder.skip_bits(remaining_bits)?;

        Ok(events)
    }
}

/// Unsigned value of an integer member, by raw bit pattern.
fn structure_uint(field: Option<&Field>, name: &str) -> Option<u64> {
    let s = field?.as_struct()?;
    match s.peek_field(name)? {
        Field::Integer(int) if int.is_set() => Some(int.raw_bits()),
        _ => None,
    }
}

/// UUID from a 16-element array of 8-bit integers named `uuid`.
fn structure_uuid(field: Option<&Field>) -> Option<Uuid> {
    let s = field?.as_struct()?;
    let array = match s.peek_field("uuid")? {
        Field::Array(a) if a.length() == 16 => a,
        _ => return None,
    };
    let mut bytes = [0u8; 16];
    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte = match array.peek_at(index)? {
            Field::Integer(int) if int.is_set() => int.raw_bits() as u8,
            _ => return None,
        };
    }
    Some(Uuid::from_bytes(bytes))
}

/// A CTF byte-stream decoder for framed async reads.
#[derive(Debug)]
pub struct PacketDecoder {
    parser: Parser,
}

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut slice: &[u8] = src.as_ref();
        match self.parser.parse(&mut slice) {
            Ok(packet) => {
                // One whole packet: consume exactly its declared size.
                src.advance(packet.context.packet_size());
                Ok(Some(packet))
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Not enough data yet
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

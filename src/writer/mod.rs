//! The stream-position codec: a bit-precise serializer that walks a
//! field tree and emits bytes into a memory-mapped packet region,
//! growing the mapping page-aligned when a field does not fit.

use crate::{error::Error, event::Event, field::Field};
use byteordered::Endianness;
use memmap2::{MmapMut, MmapOptions};
use std::{fs::File, os::fd::AsRawFd};
use tracing::{debug, trace};

pub(crate) mod bitfield;

/// Packet growth increment (bits): eight pages per step.
fn packet_len_increment_bits() -> u64 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(page > 0);
    page as u64 * 8 * 8
}

fn align_up(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// A bit-precise cursor into one packet of a stream file.
///
/// `packet_size` and `offset` are in bits; `mmap_offset` is the byte
/// offset of the current packet within the file.
#[derive(Debug)]
pub struct StreamPosition {
    file: File,
    map: Option<MmapMut>,
    packet_size: u64,
    offset: u64,
    mmap_offset: u64,
}

impl StreamPosition {
    pub(crate) fn new(file: File) -> Self {
        Self {
            file,
            map: None,
            packet_size: 0,
            offset: 0,
            mmap_offset: 0,
        }
    }

    pub(crate) fn offset_bits(&self) -> u64 {
        self.offset
    }

    pub(crate) fn set_offset_bits(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn packet_size_bits(&self) -> u64 {
        self.packet_size
    }

    /// Byte offset one past the current packet's end.
    pub(crate) fn end_byte(&self) -> u64 {
        self.mmap_offset + self.packet_size / 8
    }

    /// Marks the current packet aborted: the next packet seek maps the
    /// same region again, overwriting the partial bytes.
    pub(crate) fn poison(&mut self) {
        self.packet_size = 0;
    }

    /// Seeks to the next packet: advances past the previous packet (a
    /// no-op for the very first one), resets the bit cursor, and maps
    /// one growth increment of fresh space.
    pub(crate) fn next_packet(&mut self) -> Result<(), Error> {
        self.map = None;
        self.mmap_offset += self.packet_size / 8;
        self.offset = 0;
        self.packet_size = packet_len_increment_bits();
        debug!(
            mmap_offset = self.mmap_offset,
            packet_size = self.packet_size,
            "Packet seek"
        );
        self.allocate_and_map()
    }

    fn increase_packet_size(&mut self) -> Result<(), Error> {
        self.map = None;
        self.packet_size += packet_len_increment_bits();
        trace!(packet_size = self.packet_size, "Growing packet");
        self.allocate_and_map()
    }

    fn allocate_and_map(&mut self) -> Result<(), Error> {
        let len_bytes = self.packet_size / 8;
        loop {
            let ret = unsafe {
                libc::posix_fallocate(
                    self.file.as_raw_fd(),
                    self.mmap_offset as libc::off_t,
                    len_bytes as libc::off_t,
                )
            };
            match ret {
                0 => break,
                libc::EINTR => continue,
                libc::ENOSPC => {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot allocate {len_bytes} bytes of packet space"
                    )))
                }
                err => return Err(std::io::Error::from_raw_os_error(err).into()),
            }
        }
        let map = unsafe {
            MmapOptions::new()
                .offset(self.mmap_offset)
                .len(len_bytes as usize)
                .map_mut(&self.file)?
        };
        self.map = Some(map);
        Ok(())
    }

    /// Aligns the cursor, zero-filling the skipped bits. The packet
    /// grows first if the padding alone would overflow it.
    pub(crate) fn align(&mut self, alignment_bits: u64) -> Result<(), Error> {
        while align_up(self.offset, alignment_bits) > self.packet_size {
            self.increase_packet_size()?;
        }
        let aligned = align_up(self.offset, alignment_bits);
        if aligned != self.offset {
            let map = self.map.as_mut().expect("packet is mapped");
            bitfield::zero_bits(map, self.offset, aligned - self.offset);
            self.offset = aligned;
        }
        Ok(())
    }

    /// Aligns and writes one bit-packed value, growing the packet as
    /// needed. Growth is transparent to the field walker.
    pub(crate) fn write_bits(
        &mut self,
        value: u64,
        size: u32,
        endianness: Endianness,
        alignment_bits: u64,
    ) -> Result<(), Error> {
        while align_up(self.offset, alignment_bits) + u64::from(size) > self.packet_size {
            self.increase_packet_size()?;
        }
        self.align(alignment_bits)?;
        let map = self.map.as_mut().expect("packet is mapped");
        bitfield::write_bits(map, self.offset, size, value, endianness);
        self.offset += u64::from(size);
        Ok(())
    }

    /// Unmaps the packet region and truncates the file to the last
    /// packet's end byte.
    pub(crate) fn finalize(&mut self) {
        self.map = None;
        let _ = self.file.set_len(self.end_byte());
    }
}

/// Serializes a validated field subtree at the current position, in
/// composite document order, honoring per-type alignment and resolved
/// byte orders.
pub(crate) fn serialize_field(
    field: &Field,
    pos: &mut StreamPosition,
    native: Endianness,
) -> Result<(), Error> {
    match field {
        Field::Integer(f) => {
            if !f.is_set() {
                return Err(Error::validation("integer field value is not set"));
            }
            let ty = f.integer_type();
            pos.write_bits(
                f.raw_bits(),
                ty.size(),
                ty.byte_order().resolve(native),
                u64::from(ty.alignment()),
            )
        }
        Field::Enum(f) => serialize_field(f.container(), pos, native),
        Field::Float(f) => {
            if !f.is_set() {
                return Err(Error::validation("floating point field value is not set"));
            }
            let ty = field.ty().as_float().expect("mirrors the type");
            let endianness = ty.byte_order().resolve(native);
            let alignment = u64::from(ty.alignment());
            let value = f.value()?;
            match (ty.exponent_digits(), ty.mantissa_digits()) {
                (8, 24) => pos.write_bits(
                    u64::from((value as f32).to_bits()),
                    32,
                    endianness,
                    alignment,
                ),
                (11, 53) => pos.write_bits(value.to_bits(), 64, endianness, alignment),
                (exp, mant) => Err(Error::validation(format!(
                    "unsupported floating point layout ({exp}-bit exponent, {mant}-bit mantissa)"
                ))),
            }
        }
        Field::String(f) => {
            // A string is a run of unsigned 8-bit integers with a
            // terminating NUL.
            let value = f.value()?;
            pos.align(8)?;
            for byte in value.as_bytes() {
                pos.write_bits(u64::from(*byte), 8, native, 8)?;
            }
            pos.write_bits(0, 8, native, 8)
        }
        Field::Struct(f) => {
            pos.align(u64::from(field.ty().alignment()))?;
            for index in 0..f.field_count() {
                let member = f.struct_type().member_at(index).expect("mirrors the type");
                let child = f.peek_at(index).ok_or_else(|| {
                    Error::validation(format!("field '{}' is not set", member.name))
                })?;
                serialize_field(child, pos, native)?;
            }
            Ok(())
        }
        Field::Variant(f) => {
            let selected = f
                .selected_field()
                .map_err(|_| Error::validation("variant has no selected option"))?;
            serialize_field(selected, pos, native)
        }
        Field::Array(f) => {
            for index in 0..f.length() {
                let element = f.peek_at(index).ok_or_else(|| {
                    Error::validation(format!("array element {index} is not set"))
                })?;
                serialize_field(element, pos, native)?;
            }
            Ok(())
        }
        Field::Sequence(f) => {
            let length = f
                .length()
                .ok_or_else(|| Error::validation("sequence length is not set"))?;
            for index in 0..length {
                let element = f.peek_at(index).ok_or_else(|| {
                    Error::validation(format!("sequence element {index} is not set"))
                })?;
                serialize_field(element, pos, native)?;
            }
            Ok(())
        }
    }
}

/// Serializes one event record: header, stream event context, event
/// context, then payload.
pub(crate) fn serialize_event(
    event: &Event,
    pos: &mut StreamPosition,
    native: Endianness,
) -> Result<(), Error> {
    for field in [
        event.header(),
        event.stream_event_context(),
        event.context(),
        event.payload(),
    ]
    .into_iter()
    .flatten()
    {
        serialize_field(field, pos, native)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{ByteOrder, IntegerType, StructType};
    use pretty_assertions::assert_eq;

    fn position() -> (tempfile::TempDir, StreamPosition) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("stream"))
            .unwrap();
        (dir, StreamPosition::new(file))
    }

    #[test]
    fn first_seek_allocates_one_increment() {
        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        assert_eq!(pos.offset_bits(), 0);
        assert_eq!(pos.packet_size_bits(), packet_len_increment_bits());
    }

    #[test]
    fn writes_grow_the_packet_transparently() {
        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        let initial = pos.packet_size_bits();
        let words = initial / 64 + 16;
        for i in 0..words {
            pos.write_bits(i, 64, Endianness::Little, 8).unwrap();
        }
        assert!(pos.packet_size_bits() > initial);
        assert_eq!(pos.offset_bits(), words * 64);
    }

    #[test]
    fn poisoned_packet_is_overwritten_by_the_next_seek() {
        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        pos.write_bits(0xAB, 8, Endianness::Little, 8).unwrap();
        pos.poison();
        pos.next_packet().unwrap();
        assert_eq!(pos.end_byte(), packet_len_increment_bits() / 8);
    }

    #[test]
    fn struct_serialization_is_byte_exact() {
        let mut st = StructType::new();
        let mut magic = IntegerType::new(32).unwrap();
        magic.set_byte_order(ByteOrder::BigEndian).unwrap();
        st.add_field("magic", magic.into()).unwrap();
        st.add_field("flag", IntegerType::new(8).unwrap().into()).unwrap();

        let mut field = Field::new(st.into()).unwrap();
        {
            let s = field.as_struct_mut().unwrap();
            s.field_by_name("magic").unwrap().set_unsigned(0xC1FC1FC1).unwrap();
            s.field_by_name("flag").unwrap().set_unsigned(0x7F).unwrap();
        }

        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        serialize_field(&field, &mut pos, Endianness::Little).unwrap();
        assert_eq!(pos.offset_bits(), 40);

        let map = pos.map.as_ref().unwrap();
        assert_eq!(&map[..5], &[0xC1, 0xFC, 0x1F, 0xC1, 0x7F]);
    }

    #[test]
    fn field_round_trip_through_the_codec() {
        use crate::{parser::types::FieldDecoder, schema::Scope, schema::StringType};

        let mut st = StructType::new();
        let mut narrow = IntegerType::new(27).unwrap();
        narrow.set_signed(true).unwrap();
        st.add_field("narrow", narrow.into()).unwrap();
        let mut wide = IntegerType::new(13).unwrap();
        wide.set_byte_order(ByteOrder::BigEndian).unwrap();
        st.add_field("wide", wide.into()).unwrap();
        st.add_field("label", StringType::new().into()).unwrap();

        let mut field = Field::new(st.into()).unwrap();
        {
            let s = field.as_struct_mut().unwrap();
            s.field_by_name("narrow").unwrap().set_signed(-1234).unwrap();
            s.field_by_name("wide").unwrap().set_unsigned(0x1ABC).unwrap();
            s.field_by_name("label")
                .unwrap()
                .as_string_mut()
                .unwrap()
                .set("end")
                .unwrap();
        }

        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        serialize_field(&field, &mut pos, Endianness::Little).unwrap();

        let len = ((pos.offset_bits() + 7) / 8) as usize;
        let bytes = pos.map.as_ref().unwrap()[..len].to_vec();
        let mut decoder = FieldDecoder::new(bytes.as_slice(), Endianness::Little);
        let decoded = decoder
            .decode_scope(Scope::EventPayload, field.ty())
            .unwrap();
        assert_eq!(decoded, field);
    }

    #[test]
    fn unset_fields_do_not_serialize() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        let field = Field::new(st.into()).unwrap();

        let (_dir, mut pos) = position();
        pos.next_packet().unwrap();
        assert!(matches!(
            serialize_field(&field, &mut pos, Endianness::Little),
            Err(Error::Validation(_))
        ));
    }
}

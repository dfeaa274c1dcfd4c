use crate::{
    error::Error,
    field::{sign_extend, Field},
    schema::{FieldPath, FieldType, Scope},
};
use byteordered::Endianness;
use fxhash::FxHashMap;
use std::{io::Read, sync::Arc};

fn align_up(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// A bit-precise reader over a byte stream, symmetric to the writer's
/// stream position: alignment padding is skipped, values are read in
/// the per-field resolved byte order.
#[derive(Debug)]
pub(crate) struct StreamReader<T> {
    inner: T,
    cursor: u64,
    cur_byte: u8,
}

impl<T: Read> StreamReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cursor: 0,
            cur_byte: 0,
        }
    }

    pub fn cursor_bits(&self) -> u64 {
        self.cursor
    }

    fn next_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.inner.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn align_to(&mut self, alignment_bits: u64) -> Result<(), Error> {
        let target = align_up(self.cursor, alignment_bits);
        self.skip_bits(target - self.cursor)
    }

    /// Skips padding; the discarded bits are not interpreted.
    pub fn skip_bits(&mut self, count: u64) -> Result<(), Error> {
        let mut remaining = count;

        // Finish the partially consumed byte.
        while remaining > 0 && self.cursor % 8 != 0 {
            self.cursor += 1;
            remaining -= 1;
        }

        // Whole bytes, in chunks.
        let mut bytes = remaining / 8;
        let mut chunk = [0u8; 256];
        while bytes > 0 {
            let step = bytes.min(chunk.len() as u64) as usize;
            self.inner.read_exact(&mut chunk[..step])?;
            self.cursor += step as u64 * 8;
            bytes -= step as u64;
        }

        // Enter the next byte partway.
        let tail = remaining % 8;
        if tail > 0 {
            self.cur_byte = self.next_byte()?;
            self.cursor += tail;
        }
        Ok(())
    }

    pub fn read_bits(&mut self, size: u32, endianness: Endianness) -> Result<u64, Error> {
        debug_assert!(size >= 1 && size <= 64);

        // Byte-aligned fast path
        if self.cursor % 8 == 0 && size % 8 == 0 {
            let count = (size / 8) as usize;
            let mut buf = [0u8; 8];
            self.inner.read_exact(&mut buf[..count])?;
            self.cursor += u64::from(size);
            let mut bytes = [0u8; 8];
            return Ok(match endianness {
                Endianness::Little => {
                    bytes[..count].copy_from_slice(&buf[..count]);
                    u64::from_le_bytes(bytes)
                }
                Endianness::Big => {
                    bytes[8 - count..].copy_from_slice(&buf[..count]);
                    u64::from_be_bytes(bytes)
                }
            });
        }

        let mut value = 0u64;
        for i in 0..size {
            if self.cursor % 8 == 0 {
                self.cur_byte = self.next_byte()?;
            }
            let in_byte = (self.cursor % 8) as u32;
            let shift = match endianness {
                Endianness::Little => in_byte,
                Endianness::Big => 7 - in_byte,
            };
            let bit = u64::from((self.cur_byte >> shift) & 1);
            match endianness {
                Endianness::Little => value |= bit << i,
                Endianness::Big => value = (value << 1) | bit,
            }
            self.cursor += 1;
        }
        Ok(value)
    }
}

/// Decodes field trees from a [`StreamReader`], resolving sequence
/// lengths and variant tags against the integer leaves already decoded
/// in this packet, keyed by field path.
#[derive(Debug)]
pub(crate) struct FieldDecoder<T> {
    reader: StreamReader<T>,
    native: Endianness,
    int_values: FxHashMap<FieldPath, u64>,
    stack: Vec<i32>,
    scope: Scope,
}

impl<T: Read> FieldDecoder<T> {
    pub fn new(inner: T, native: Endianness) -> Self {
        Self {
            reader: StreamReader::new(inner),
            native,
            int_values: FxHashMap::default(),
            stack: Vec::new(),
            scope: Scope::TracePacketHeader,
        }
    }

    pub fn cursor_bits(&self) -> u64 {
        self.reader.cursor_bits()
    }

    pub fn skip_bits(&mut self, count: u64) -> Result<(), Error> {
        self.reader.skip_bits(count)
    }

    /// Decodes one scope root.
    pub fn decode_scope(&mut self, scope: Scope, ty: &Arc<FieldType>) -> Result<Field, Error> {
        self.scope = scope;
        self.stack.clear();
        self.decode(ty)
    }

    fn record(&mut self, raw: u64) {
        self.int_values.insert(
            FieldPath {
                root: self.scope,
                indexes: self.stack.clone(),
            },
            raw,
        );
    }

    fn lookup(&self, path: &FieldPath) -> Result<u64, Error> {
        self.int_values.get(path).copied().ok_or_else(|| {
            Error::validation(format!("dynamic field target {path} has not been decoded"))
        })
    }

    fn read_integer(&mut self, size: u32, byte_order: Endianness, alignment: u32) -> Result<u64, Error> {
        self.reader.align_to(u64::from(alignment))?;
        self.reader.read_bits(size, byte_order)
    }

    fn decode(&mut self, ty: &Arc<FieldType>) -> Result<Field, Error> {
        let mut field = Field::from_arc(ty.clone());
        match (&mut field, ty.as_ref()) {
            (Field::Integer(f), FieldType::Integer(t)) => {
                let raw =
                    self.read_integer(t.size(), t.byte_order().resolve(self.native), t.alignment())?;
                f.set_raw_bits(raw);
                self.record(raw);
            }
            (Field::Enum(f), FieldType::Enum(t)) => {
                let container = t.container();
                let raw = self.read_integer(
                    container.size(),
                    container.byte_order().resolve(self.native),
                    container.alignment(),
                )?;
                f.container_mut()
                    .as_integer_mut()
                    .expect("enumeration container is an integer")
                    .set_raw_bits(raw);
                self.record(raw);
            }
            (Field::Float(f), FieldType::Float(t)) => {
                let endianness = t.byte_order().resolve(self.native);
                self.reader.align_to(u64::from(t.alignment()))?;
                let value = match (t.exponent_digits(), t.mantissa_digits()) {
                    (8, 24) => f64::from(f32::from_bits(
                        self.reader.read_bits(32, endianness)? as u32,
                    )),
                    (11, 53) => f64::from_bits(self.reader.read_bits(64, endianness)?),
                    (exp, mant) => {
                        return Err(Error::validation(format!(
                            "unsupported floating point layout ({exp}-bit exponent, {mant}-bit mantissa)"
                        )))
                    }
                };
                f.set_decoded(value);
            }
            (Field::String(f), FieldType::String(_)) => {
                self.reader.align_to(8)?;
                let mut bytes = Vec::new();
                loop {
                    let byte = self.reader.read_bits(8, self.native)? as u8;
                    if byte == 0 {
                        break;
                    }
                    bytes.push(byte);
                }
                f.set_decoded(String::from_utf8_lossy(&bytes).to_string());
            }
            (Field::Struct(f), FieldType::Struct(t)) => {
                self.reader.align_to(u64::from(ty.alignment()))?;
                for index in 0..t.field_count() {
                    let member_ty = t.member_at(index).expect("in range").ty.clone();
                    self.stack.push(index as i32);
                    let child = self.decode(&member_ty)?;
                    self.stack.pop();
                    f.install_child(index, child);
                }
            }
            (Field::Variant(f), FieldType::Variant(t)) => {
                let path = t
                    .tag_field_path()
                    .ok_or_else(|| Error::validation("variant tag path is unresolved"))?;
                let raw = self.lookup(path)?;
                let tag = t
                    .tag_type()
                    .ok_or_else(|| Error::validation("variant tag type is unresolved"))?;
                let index = if tag.is_signed() {
                    t.option_index_for_tag_signed(sign_extend(raw, tag.container().size()))
                } else {
                    t.option_index_for_tag_unsigned(raw)
                }
                .ok_or_else(|| {
                    Error::validation(format!("no variant option for tag value {raw}"))
                })?;
                let option_ty = t.option_at(index).expect("in range").ty.clone();
                self.stack.push(index as i32);
                let child = self.decode(&option_ty)?;
                self.stack.pop();
                f.install_selected(index, raw, child);
            }
            (Field::Array(f), FieldType::Array(t)) => {
                let element_ty = t.element_type().clone();
                for index in 0..t.length() as usize {
                    self.stack.push(-1);
                    let child = self.decode(&element_ty)?;
                    self.stack.pop();
                    f.install_element(index, child);
                }
            }
            (Field::Sequence(f), FieldType::Sequence(t)) => {
                let path = t
                    .length_field_path()
                    .ok_or_else(|| Error::validation("sequence length path is unresolved"))?;
                let length = self.lookup(path)? as usize;
                f.set_length(length)?;
                let element_ty = t.element_type().clone();
                for index in 0..length {
                    self.stack.push(-1);
                    let child = self.decode(&element_ty)?;
                    self.stack.pop();
                    f.install_element(index, child);
                }
            }
            _ => unreachable!("field kind mirrors its type"),
        }
        Ok(field)
    }
}

use crate::{
    error::Error,
    field::Field,
    schema::{FieldType, PreferredDisplayBase},
};
use derive_more::Display;
use internment::Intern;
use num_enum::{FromPrimitive, IntoPrimitive};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

pub use event::Event;
pub use packet::{Packet, PacketContext, PacketHeader};

pub mod event;
pub mod packet;

pub type StreamId = u64;

pub type EventId = u64;

/// Timestamp in cycles
pub type Timestamp = u64;

pub type EventCount = u64;

pub type SequenceNumber = u64;

pub const CTF_MAGIC_NUMBER: u32 = 0xC1FC1FC1;

#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    IntoPrimitive,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum LogLevel {
    #[display("EMERG")]
    Emergency = 0,
    #[display("ALERT")]
    Alert = 1,
    #[display("CRIT")]
    Critical = 2,
    #[display("ERR")]
    Error = 3,
    #[display("WARNING")]
    Warning = 4,
    #[display("NOTICE")]
    Notice = 5,
    #[display("INFO")]
    Info = 6,
    #[display("DEBUG_SYSTEM")]
    DebugSystem = 7,
    #[display("DEBUG_PROGRAM")]
    DebugProgram = 8,
    #[display("DEBUG_PROCESS")]
    DebugProcess = 9,
    #[display("DEBUG_MODULE")]
    DebugModule = 10,
    #[display("DEBUG_UNIT")]
    DebugUnit = 11,
    #[display("DEBUG_FUNCTION")]
    DebugFunction = 12,
    #[display("DEBUG_LINE")]
    DebugLine = 13,
    #[display("DEBUG")]
    Debug = 14,
    #[display("{_0}")]
    #[num_enum(catch_all)]
    Other(i32),
}

/// A decoded field value, detached from the IR field graph so that
/// consumers do not keep IR references alive.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FieldValue {
    UnsignedInteger(u64, PreferredDisplayBase),
    SignedInteger(i64, PreferredDisplayBase),
    String(String),
    F32(OrderedFloat<f32>),
    F64(OrderedFloat<f64>),
    /// NOTE: unsigned enumeration values are converted to signed.
    Enumeration(i64, PreferredDisplayBase, Option<Intern<String>>),
    Struct(Vec<(Intern<String>, FieldValue)>),
    Variant(Intern<String>, Box<FieldValue>),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// Converts a fully set IR field into a detached value.
    pub fn from_field(field: &Field) -> Result<Self, Error> {
        Ok(match field {
            Field::Integer(f) => {
                let ty = f.integer_type();
                if ty.is_signed() {
                    FieldValue::SignedInteger(f.signed_value()?, ty.base())
                } else {
                    FieldValue::UnsignedInteger(f.unsigned_value()?, ty.base())
                }
            }
            Field::Enum(f) => {
                let ty = f.enum_type();
                let base = ty.container().base();
                let value = if ty.is_signed() {
                    f.container().signed_value()?
                } else {
                    f.container().unsigned_value()? as i64
                };
                FieldValue::Enumeration(value, base, f.mapped_label()?)
            }
            Field::Float(f) => {
                let size = field
                    .ty()
                    .as_float()
                    .expect("mirrors the type")
                    .size();
                let value = f.value()?;
                if size == 32 {
                    FieldValue::F32(OrderedFloat(value as f32))
                } else {
                    FieldValue::F64(OrderedFloat(value))
                }
            }
            Field::String(f) => FieldValue::String(f.value()?.to_owned()),
            Field::Struct(f) => {
                let ty = f.struct_type();
                let mut members = Vec::with_capacity(f.field_count());
                for index in 0..f.field_count() {
                    let member = ty.member_at(index).expect("mirrors the type");
                    let child = f.peek_at(index).ok_or_else(|| {
                        Error::validation(format!("field '{}' is not set", member.name))
                    })?;
                    members.push((member.name, FieldValue::from_field(child)?));
                }
                FieldValue::Struct(members)
            }
            Field::Variant(f) => {
                let index = f
                    .selected_index()
                    .ok_or_else(|| Error::validation("variant has no selected option"))?;
                let label = f
                    .variant_type()
                    .option_at(index)
                    .expect("mirrors the type")
                    .name;
                FieldValue::Variant(label, Box::new(FieldValue::from_field(f.selected_field()?)?))
            }
            Field::Array(f) => {
                let mut elements = Vec::with_capacity(f.length());
                for index in 0..f.length() {
                    let element = f.peek_at(index).ok_or_else(|| {
                        Error::validation(format!("array element {index} is not set"))
                    })?;
                    elements.push(FieldValue::from_field(element)?);
                }
                FieldValue::Array(elements)
            }
            Field::Sequence(f) => {
                let length = f
                    .length()
                    .ok_or_else(|| Error::validation("sequence length is not set"))?;
                let mut elements = Vec::with_capacity(length);
                for index in 0..length {
                    let element = f.peek_at(index).ok_or_else(|| {
                        Error::validation(format!("sequence element {index} is not set"))
                    })?;
                    elements.push(FieldValue::from_field(element)?);
                }
                FieldValue::Array(elements)
            }
        })
    }

    /// Members of a decoded structure root, or a single anonymous
    /// entry for a non-structure root.
    pub(crate) fn into_members(self) -> Vec<(Intern<String>, FieldValue)> {
        match self {
            FieldValue::Struct(members) => members,
            other => vec![(Intern::new(String::new()), other)],
        }
    }
}

/// Decodes an optional scope root into named members.
pub(crate) fn decode_members(
    root_type: Option<&std::sync::Arc<FieldType>>,
    field: Option<&Field>,
) -> Result<Vec<(Intern<String>, FieldValue)>, Error> {
    match (root_type, field) {
        (Some(_), Some(field)) => Ok(FieldValue::from_field(field)?.into_members()),
        _ => Ok(Vec::new()),
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        FieldValue::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UnsignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UnsignedInteger(v, PreferredDisplayBase::default())
    }
}

impl From<i8> for FieldValue {
    fn from(v: i8) -> Self {
        FieldValue::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        FieldValue::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::SignedInteger(v.into(), PreferredDisplayBase::default())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::SignedInteger(v, PreferredDisplayBase::default())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_owned())
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::F32(OrderedFloat(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(OrderedFloat(v))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::IntegerType;

    #[test]
    fn integer_fields_detach_with_their_display_base() {
        let mut ty = IntegerType::new(16).unwrap();
        ty.set_base(PreferredDisplayBase::Hexadecimal).unwrap();
        let mut field = Field::new(ty.into()).unwrap();
        field.set_unsigned(0xBEEF).unwrap();

        assert_eq!(
            FieldValue::from_field(&field).unwrap(),
            FieldValue::UnsignedInteger(0xBEEF, PreferredDisplayBase::Hexadecimal)
        );
    }

    #[test]
    fn unset_fields_do_not_detach() {
        let field = Field::new(IntegerType::new(16).unwrap().into()).unwrap();
        assert!(FieldValue::from_field(&field).is_err());
    }

    #[test]
    fn log_level_round_trips_through_i32() {
        assert_eq!(LogLevel::from(6), LogLevel::Info);
        assert_eq!(i32::from(LogLevel::Debug), 14);
        assert_eq!(LogLevel::from(99), LogLevel::Other(99));
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }
}

use crate::{
    error::Error,
    schema::{EnumType, FieldType, IntegerType, StructType, VariantType},
};
use internment::Intern;
use std::sync::Arc;

fn bit_mask(size: u32) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

pub(crate) fn sign_extend(raw: u64, size: u32) -> i64 {
    ((raw << (64 - size)) as i64) >> (64 - size)
}

/// A field: one instance of a field type. The field tree mirrors the
/// type tree; leaves track whether their payload has been set.
#[derive(Clone, Debug)]
pub enum Field {
    Integer(IntegerField),
    Float(FloatField),
    Enum(EnumField),
    String(StringField),
    Struct(StructField),
    Variant(VariantField),
    Array(ArrayField),
    Sequence(SequenceField),
}

impl Field {
    /// Instantiates a field from a type. The type is validated and
    /// frozen: its declaration can't change once a field exists.
    pub fn new(mut ty: FieldType) -> Result<Self, Error> {
        ty.validate()?;
        ty.freeze();
        Ok(Self::from_arc(Arc::new(ty)))
    }

    /// Instantiates a field from an already frozen shared type.
    pub(crate) fn from_arc(ty: Arc<FieldType>) -> Self {
        debug_assert!(ty.is_frozen());
        match ty.as_ref() {
            FieldType::Integer(_) => Field::Integer(IntegerField {
                ty,
                raw: 0,
                set: false,
                frozen: false,
            }),
            FieldType::Float(_) => Field::Float(FloatField {
                ty,
                value: 0.0,
                set: false,
                frozen: false,
            }),
            FieldType::Enum(t) => {
                let container = Box::new(Field::from_arc(t.container_type().clone()));
                Field::Enum(EnumField {
                    ty,
                    container,
                    frozen: false,
                })
            }
            FieldType::String(_) => Field::String(StringField {
                ty,
                payload: String::new(),
                set: false,
                frozen: false,
            }),
            FieldType::Struct(t) => {
                let fields = vec![None; t.field_count()];
                Field::Struct(StructField {
                    ty,
                    fields,
                    frozen: false,
                })
            }
            FieldType::Variant(_) => Field::Variant(VariantField {
                ty,
                tag_raw: None,
                selected: None,
                frozen: false,
            }),
            FieldType::Array(t) => {
                let elements = vec![None; t.length() as usize];
                Field::Array(ArrayField {
                    ty,
                    elements,
                    frozen: false,
                })
            }
            FieldType::Sequence(_) => Field::Sequence(SequenceField {
                ty,
                elements: None,
                frozen: false,
            }),
        }
    }

    pub fn ty(&self) -> &Arc<FieldType> {
        match self {
            Field::Integer(f) => &f.ty,
            Field::Float(f) => &f.ty,
            Field::Enum(f) => &f.ty,
            Field::String(f) => &f.ty,
            Field::Struct(f) => &f.ty,
            Field::Variant(f) => &f.ty,
            Field::Array(f) => &f.ty,
            Field::Sequence(f) => &f.ty,
        }
    }

    /// Returns `Validation` if any leaf of the subtree is unset. A
    /// variant only requires its currently selected option.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Field::Integer(f) => {
                if !f.set {
                    return Err(Error::validation("integer field value is not set"));
                }
                Ok(())
            }
            Field::Float(f) => {
                if !f.set {
                    return Err(Error::validation("floating point field value is not set"));
                }
                Ok(())
            }
            Field::String(f) => {
                if !f.set {
                    return Err(Error::validation("string field value is not set"));
                }
                Ok(())
            }
            Field::Enum(f) => f.container.validate(),
            Field::Struct(f) => {
                for (index, slot) in f.fields.iter().enumerate() {
                    let member = f.struct_type().member_at(index).expect("mirrors the type");
                    match slot {
                        Some(field) => field.validate().map_err(|e| {
                            Error::validation(format!("in field '{}': {e}", member.name))
                        })?,
                        None => {
                            return Err(Error::validation(format!(
                                "field '{}' is not set",
                                member.name
                            )))
                        }
                    }
                }
                Ok(())
            }
            Field::Variant(f) => match f.selected.as_ref() {
                Some((_, field)) => field.validate(),
                None => Err(Error::validation("variant has no selected option")),
            },
            Field::Array(f) => {
                for (index, slot) in f.elements.iter().enumerate() {
                    match slot {
                        Some(field) => field.validate()?,
                        None => {
                            return Err(Error::validation(format!(
                                "array element {index} is not set"
                            )))
                        }
                    }
                }
                Ok(())
            }
            Field::Sequence(f) => match f.elements.as_ref() {
                None => Err(Error::validation("sequence length is not set")),
                Some(elements) => {
                    for (index, slot) in elements.iter().enumerate() {
                        match slot {
                            Some(field) => field.validate()?,
                            None => {
                                return Err(Error::validation(format!(
                                    "sequence element {index} is not set"
                                )))
                            }
                        }
                    }
                    Ok(())
                }
            },
        }
    }

    /// Clears the payload-set mark on every leaf without shrinking
    /// buffers, dropping selections, or changing lengths.
    pub fn reset(&mut self) {
        match self {
            Field::Integer(f) => f.set = false,
            Field::Float(f) => f.set = false,
            Field::String(f) => {
                f.payload.clear();
                f.set = false;
            }
            Field::Enum(f) => f.container.reset(),
            Field::Struct(f) => {
                for slot in f.fields.iter_mut().flatten() {
                    slot.reset();
                }
            }
            Field::Variant(f) => {
                if let Some((_, field)) = f.selected.as_mut() {
                    field.reset();
                }
            }
            Field::Array(f) => {
                for slot in f.elements.iter_mut().flatten() {
                    slot.reset();
                }
            }
            Field::Sequence(f) => {
                if let Some(elements) = f.elements.as_mut() {
                    for slot in elements.iter_mut().flatten() {
                        slot.reset();
                    }
                }
            }
        }
    }

    /// Marks the whole subtree immutable.
    pub fn freeze(&mut self) {
        match self {
            Field::Integer(f) => f.frozen = true,
            Field::Float(f) => f.frozen = true,
            Field::String(f) => f.frozen = true,
            Field::Enum(f) => {
                f.frozen = true;
                f.container.freeze();
            }
            Field::Struct(f) => {
                f.frozen = true;
                for slot in f.fields.iter_mut().flatten() {
                    slot.freeze();
                }
            }
            Field::Variant(f) => {
                f.frozen = true;
                if let Some((_, field)) = f.selected.as_mut() {
                    field.freeze();
                }
            }
            Field::Array(f) => {
                f.frozen = true;
                for slot in f.elements.iter_mut().flatten() {
                    slot.freeze();
                }
            }
            Field::Sequence(f) => {
                f.frozen = true;
                if let Some(elements) = f.elements.as_mut() {
                    for slot in elements.iter_mut().flatten() {
                        slot.freeze();
                    }
                }
            }
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Field::Integer(f) => f.frozen,
            Field::Float(f) => f.frozen,
            Field::Enum(f) => f.frozen,
            Field::String(f) => f.frozen,
            Field::Struct(f) => f.frozen,
            Field::Variant(f) => f.frozen,
            Field::Array(f) => f.frozen,
            Field::Sequence(f) => f.frozen,
        }
    }

    pub fn as_integer(&self) -> Option<&IntegerField> {
        match self {
            Field::Integer(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_integer_mut(&mut self) -> Option<&mut IntegerField> {
        match self {
            Field::Integer(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_float_mut(&mut self) -> Option<&mut FloatField> {
        match self {
            Field::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumField> {
        match self {
            Field::Enum(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_enum_mut(&mut self) -> Option<&mut EnumField> {
        match self {
            Field::Enum(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_string_mut(&mut self) -> Option<&mut StringField> {
        match self {
            Field::String(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructField> {
        match self {
            Field::Struct(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut StructField> {
        match self {
            Field::Struct(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_variant_mut(&mut self) -> Option<&mut VariantField> {
        match self {
            Field::Variant(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayField> {
        match self {
            Field::Array(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_sequence_mut(&mut self) -> Option<&mut SequenceField> {
        match self {
            Field::Sequence(f) => Some(f),
            _ => None,
        }
    }

    /// Sets a signed integer payload (integer fields only).
    pub fn set_signed(&mut self, value: i64) -> Result<(), Error> {
        self.as_integer_mut()
            .ok_or_else(|| Error::invalid("not an integer field"))?
            .set_signed(value)
    }

    /// Sets an unsigned integer payload (integer fields only).
    pub fn set_unsigned(&mut self, value: u64) -> Result<(), Error> {
        self.as_integer_mut()
            .ok_or_else(|| Error::invalid("not an integer field"))?
            .set_unsigned(value)
    }

    pub fn signed_value(&self) -> Result<i64, Error> {
        self.as_integer()
            .ok_or_else(|| Error::invalid("not an integer field"))?
            .signed_value()
    }

    pub fn unsigned_value(&self) -> Result<u64, Error> {
        self.as_integer()
            .ok_or_else(|| Error::invalid("not an integer field"))?
            .unsigned_value()
    }
}

/// Integer field instance. The payload is kept as the raw bit pattern
/// of the type's width.
#[derive(Clone, Debug)]
pub struct IntegerField {
    ty: Arc<FieldType>,
    raw: u64,
    set: bool,
    frozen: bool,
}

impl IntegerField {
    pub fn integer_type(&self) -> &IntegerType {
        self.ty.as_integer().expect("mirrors the type")
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("integer field"))
        } else {
            Ok(())
        }
    }

    pub fn set_signed(&mut self, value: i64) -> Result<(), Error> {
        self.check_frozen()?;
        let ty = self.integer_type();
        if !ty.is_signed() {
            return Err(Error::invalid("signed value for an unsigned integer field"));
        }
        let size = ty.size();
        if size < 64 {
            let min = -(1i64 << (size - 1));
            let max = (1i64 << (size - 1)) - 1;
            if value < min || value > max {
                return Err(Error::invalid(format!(
                    "value {value} is outside [{min}, {max}] for a {size}-bit signed integer"
                )));
            }
        }
        self.raw = (value as u64) & bit_mask(size);
        self.set = true;
        Ok(())
    }

    pub fn set_unsigned(&mut self, value: u64) -> Result<(), Error> {
        self.check_frozen()?;
        let ty = self.integer_type();
        if ty.is_signed() {
            return Err(Error::invalid("unsigned value for a signed integer field"));
        }
        let size = ty.size();
        let max = bit_mask(size);
        if value > max {
            return Err(Error::invalid(format!(
                "value {value} is outside [0, {max}] for a {size}-bit unsigned integer"
            )));
        }
        self.raw = value;
        self.set = true;
        Ok(())
    }

    pub fn signed_value(&self) -> Result<i64, Error> {
        if !self.set {
            return Err(Error::invalid("integer field value is not set"));
        }
        let ty = self.integer_type();
        if !ty.is_signed() {
            return Err(Error::invalid("signed read of an unsigned integer field"));
        }
        Ok(sign_extend(self.raw, ty.size()))
    }

    pub fn unsigned_value(&self) -> Result<u64, Error> {
        if !self.set {
            return Err(Error::invalid("integer field value is not set"));
        }
        if self.integer_type().is_signed() {
            return Err(Error::invalid("unsigned read of a signed integer field"));
        }
        Ok(self.raw)
    }

    pub(crate) fn raw_bits(&self) -> u64 {
        self.raw
    }

    /// Installs a decoded raw bit pattern, bypassing range checks.
    pub(crate) fn set_raw_bits(&mut self, raw: u64) {
        let size = self.integer_type().size();
        self.raw = raw & bit_mask(size);
        self.set = true;
    }
}

/// Floating point field instance.
#[derive(Clone, Debug)]
pub struct FloatField {
    ty: Arc<FieldType>,
    value: f64,
    set: bool,
    frozen: bool,
}

impl FloatField {
    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn set(&mut self, value: f64) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("floating point field"));
        }
        let ty = self.ty.as_float().expect("mirrors the type");
        if ty.is_single_precision() && (value as f32) as f64 != value {
            return Err(Error::validation(format!(
                "value {value} is not representable in single precision"
            )));
        }
        self.value = value;
        self.set = true;
        Ok(())
    }

    pub fn value(&self) -> Result<f64, Error> {
        if !self.set {
            return Err(Error::invalid("floating point field value is not set"));
        }
        Ok(self.value)
    }

    pub(crate) fn set_decoded(&mut self, value: f64) {
        self.value = value;
        self.set = true;
    }
}

/// Enumeration field instance: wraps an integer container field.
#[derive(Clone, Debug)]
pub struct EnumField {
    ty: Arc<FieldType>,
    container: Box<Field>,
    frozen: bool,
}

impl EnumField {
    pub fn enum_type(&self) -> &EnumType {
        self.ty.as_enum().expect("mirrors the type")
    }

    pub fn container(&self) -> &Field {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut Field {
        &mut self.container
    }

    /// Label of the first mapping covering the current container value.
    pub fn mapped_label(&self) -> Result<Option<Intern<String>>, Error> {
        let ty = self.enum_type();
        let mapping = if ty.is_signed() {
            ty.mapping_for_signed(self.container.signed_value()?)
        } else {
            ty.mapping_for_unsigned(self.container.unsigned_value()?)
        };
        Ok(mapping.map(|m| m.label))
    }
}

/// String field instance: a growable byte payload, NUL-terminated on
/// the wire.
#[derive(Clone, Debug)]
pub struct StringField {
    ty: Arc<FieldType>,
    payload: String,
    set: bool,
    frozen: bool,
}

impl StringField {
    pub fn is_set(&self) -> bool {
        self.set
    }

    fn check_value(value: &str) -> Result<(), Error> {
        if value.contains('\0') {
            return Err(Error::validation("string value contains a NUL byte"));
        }
        Ok(())
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("string field"))
        } else {
            Ok(())
        }
    }

    pub fn set(&mut self, value: &str) -> Result<(), Error> {
        self.check_frozen()?;
        Self::check_value(value)?;
        self.payload.clear();
        self.payload.push_str(value);
        self.set = true;
        Ok(())
    }

    pub fn append(&mut self, value: &str) -> Result<(), Error> {
        self.check_frozen()?;
        Self::check_value(value)?;
        self.payload.push_str(value);
        self.set = true;
        Ok(())
    }

    /// Appends the first `length` bytes of `value`, which must fall on
    /// a character boundary.
    pub fn append_with_length(&mut self, value: &str, length: usize) -> Result<(), Error> {
        self.check_frozen()?;
        let length = length.min(value.len());
        let head = value
            .get(..length)
            .ok_or_else(|| Error::invalid("length does not fall on a character boundary"))?;
        self.append(head)
    }

    pub fn value(&self) -> Result<&str, Error> {
        if !self.set {
            return Err(Error::invalid("string field value is not set"));
        }
        Ok(&self.payload)
    }

    pub(crate) fn set_decoded(&mut self, value: String) {
        self.payload = value;
        self.set = true;
    }
}

/// Structure field instance. Child fields are created lazily on first
/// access.
#[derive(Clone, Debug)]
pub struct StructField {
    ty: Arc<FieldType>,
    fields: Vec<Option<Field>>,
    frozen: bool,
}

impl StructField {
    pub fn struct_type(&self) -> &StructType {
        self.ty.as_struct().expect("mirrors the type")
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn materialize(&mut self, index: usize) -> &mut Field {
        if self.fields[index].is_none() {
            let member_ty = self
                .struct_type()
                .member_at(index)
                .expect("mirrors the type")
                .ty
                .clone();
            let mut field = Field::from_arc(member_ty);
            if self.frozen {
                field.freeze();
            }
            self.fields[index] = Some(field);
        }
        self.fields[index].as_mut().expect("materialized above")
    }

    pub fn field_by_name(&mut self, name: &str) -> Result<&mut Field, Error> {
        let index = self
            .struct_type()
            .field_index(name)
            .ok_or_else(|| Error::not_found(name))?;
        Ok(self.materialize(index))
    }

    pub fn field_at(&mut self, index: usize) -> Result<&mut Field, Error> {
        if index >= self.fields.len() {
            return Err(Error::invalid(format!(
                "structure field index {index} is out of bounds ({} fields)",
                self.fields.len()
            )));
        }
        Ok(self.materialize(index))
    }

    /// Read-only lookup that does not materialize missing children.
    pub fn peek_field(&self, name: &str) -> Option<&Field> {
        let index = self.struct_type().field_index(name)?;
        self.fields.get(index)?.as_ref()
    }

    pub fn peek_at(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)?.as_ref()
    }

    /// Installs a decoded child, bypassing the type-equality check the
    /// decoder already guarantees by construction.
    pub(crate) fn install_child(&mut self, index: usize, field: Field) {
        self.fields[index] = Some(field);
    }

    /// Replaces a child field after checking structural type equality.
    pub fn set_field(&mut self, name: &str, field: Field) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("structure field"));
        }
        let index = self
            .struct_type()
            .field_index(name)
            .ok_or_else(|| Error::not_found(name))?;
        let expected = &self.struct_type().member_at(index).expect("checked").ty;
        if expected.as_ref() != field.ty().as_ref() {
            return Err(Error::TypeMismatch(name.to_owned()));
        }
        self.fields[index] = Some(field);
        Ok(())
    }
}

/// Variant field instance: at most one selected option, chosen by a
/// tag value looked up in the resolved tag enumeration.
#[derive(Clone, Debug)]
pub struct VariantField {
    ty: Arc<FieldType>,
    tag_raw: Option<u64>,
    selected: Option<(usize, Box<Field>)>,
    frozen: bool,
}

impl VariantField {
    pub fn variant_type(&self) -> &VariantType {
        self.ty.as_variant().expect("mirrors the type")
    }

    fn select(&mut self, index: usize, tag_raw: u64) -> &mut Field {
        let replace = match self.selected.as_ref() {
            Some((current, _)) => *current != index,
            None => true,
        };
        if replace {
            let option_ty = self
                .variant_type()
                .option_at(index)
                .expect("index from the type")
                .ty
                .clone();
            let mut field = Field::from_arc(option_ty);
            if self.frozen {
                field.freeze();
            }
            self.selected = Some((index, Box::new(field)));
        }
        self.tag_raw = Some(tag_raw);
        self.selected.as_mut().map(|(_, f)| f.as_mut()).expect("selected above")
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("variant field"))
        } else {
            Ok(())
        }
    }

    /// Selects the option designated by a signed tag value and returns
    /// its (possibly fresh) field.
    pub fn set_tag_signed(&mut self, value: i64) -> Result<&mut Field, Error> {
        self.check_frozen()?;
        let index = self
            .variant_type()
            .option_index_for_tag_signed(value)
            .ok_or_else(|| Error::not_found(format!("variant option for tag value {value}")))?;
        Ok(self.select(index, value as u64))
    }

    pub fn set_tag_unsigned(&mut self, value: u64) -> Result<&mut Field, Error> {
        self.check_frozen()?;
        let index = self
            .variant_type()
            .option_index_for_tag_unsigned(value)
            .ok_or_else(|| Error::not_found(format!("variant option for tag value {value}")))?;
        Ok(self.select(index, value))
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected.as_ref().map(|(i, _)| *i)
    }

    pub(crate) fn install_selected(&mut self, index: usize, tag_raw: u64, field: Field) {
        self.tag_raw = Some(tag_raw);
        self.selected = Some((index, Box::new(field)));
    }

    pub fn selected_field(&self) -> Result<&Field, Error> {
        self.selected
            .as_ref()
            .map(|(_, f)| f.as_ref())
            .ok_or_else(|| Error::invalid("variant has no selected option (tag is not set)"))
    }

    pub fn selected_field_mut(&mut self) -> Result<&mut Field, Error> {
        self.selected
            .as_mut()
            .map(|(_, f)| f.as_mut())
            .ok_or_else(|| Error::invalid("variant has no selected option (tag is not set)"))
    }
}

/// Array field instance with a fixed element count.
#[derive(Clone, Debug)]
pub struct ArrayField {
    ty: Arc<FieldType>,
    elements: Vec<Option<Field>>,
    frozen: bool,
}

impl ArrayField {
    pub fn length(&self) -> usize {
        self.elements.len()
    }

    fn element_ty(&self) -> Arc<FieldType> {
        self.ty
            .as_array()
            .expect("mirrors the type")
            .element_type()
            .clone()
    }

    pub fn field_at(&mut self, index: usize) -> Result<&mut Field, Error> {
        if index >= self.elements.len() {
            return Err(Error::invalid(format!(
                "array index {index} is out of bounds (length {})",
                self.elements.len()
            )));
        }
        if self.elements[index].is_none() {
            let mut field = Field::from_arc(self.element_ty());
            if self.frozen {
                field.freeze();
            }
            self.elements[index] = Some(field);
        }
        Ok(self.elements[index].as_mut().expect("materialized above"))
    }

    pub fn peek_at(&self, index: usize) -> Option<&Field> {
        self.elements.get(index)?.as_ref()
    }

    pub(crate) fn install_element(&mut self, index: usize, field: Field) {
        self.elements[index] = Some(field);
    }
}

/// Maximum sequence length accepted by [`SequenceField::set_length`].
const MAX_SEQUENCE_LENGTH: usize = 1 << 31;

/// Sequence field instance: the length must be set before elements can
/// be accessed.
#[derive(Clone, Debug)]
pub struct SequenceField {
    ty: Arc<FieldType>,
    elements: Option<Vec<Option<Field>>>,
    frozen: bool,
}

impl SequenceField {
    pub fn length(&self) -> Option<usize> {
        self.elements.as_ref().map(|e| e.len())
    }

    fn element_ty(&self) -> Arc<FieldType> {
        self.ty
            .as_sequence()
            .expect("mirrors the type")
            .element_type()
            .clone()
    }

    /// Sets the element count. Growing creates unset element slots;
    /// shrinking drops the tail.
    pub fn set_length(&mut self, length: usize) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("sequence field"));
        }
        if length > MAX_SEQUENCE_LENGTH {
            return Err(Error::invalid(format!(
                "sequence length {length} exceeds {MAX_SEQUENCE_LENGTH}"
            )));
        }
        match self.elements.as_mut() {
            Some(elements) => elements.resize(length, None),
            None => self.elements = Some(vec![None; length]),
        }
        Ok(())
    }

    pub fn field_at(&mut self, index: usize) -> Result<&mut Field, Error> {
        let frozen = self.frozen;
        let element_ty = self.element_ty();
        let elements = self
            .elements
            .as_mut()
            .ok_or_else(|| Error::invalid("sequence length is not set"))?;
        if index >= elements.len() {
            return Err(Error::invalid(format!(
                "sequence index {index} is out of bounds (length {})",
                elements.len()
            )));
        }
        if elements[index].is_none() {
            let mut field = Field::from_arc(element_ty);
            if frozen {
                field.freeze();
            }
            elements[index] = Some(field);
        }
        Ok(elements[index].as_mut().expect("materialized above"))
    }

    pub fn peek_at(&self, index: usize) -> Option<&Field> {
        self.elements.as_ref()?.get(index)?.as_ref()
    }

    pub(crate) fn install_element(&mut self, index: usize, field: Field) {
        self.elements
            .as_mut()
            .expect("length set by the decoder")[index] = Some(field);
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Field::Integer(a), Field::Integer(b)) => {
                a.ty == b.ty && a.set == b.set && (!a.set || a.raw == b.raw)
            }
            (Field::Float(a), Field::Float(b)) => {
                a.ty == b.ty && a.set == b.set && (!a.set || a.value.to_bits() == b.value.to_bits())
            }
            (Field::Enum(a), Field::Enum(b)) => a.ty == b.ty && a.container == b.container,
            (Field::String(a), Field::String(b)) => {
                a.ty == b.ty && a.set == b.set && (!a.set || a.payload == b.payload)
            }
            (Field::Struct(a), Field::Struct(b)) => a.ty == b.ty && a.fields == b.fields,
            (Field::Variant(a), Field::Variant(b)) => a.ty == b.ty && a.selected == b.selected,
            (Field::Array(a), Field::Array(b)) => a.ty == b.ty && a.elements == b.elements,
            (Field::Sequence(a), Field::Sequence(b)) => a.ty == b.ty && a.elements == b.elements,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{ArrayType, SequenceType, StringType};

    fn int_field(size: u32, signed: bool) -> Field {
        let mut ty = IntegerType::new(size).unwrap();
        ty.set_signed(signed).unwrap();
        Field::new(ty.into()).unwrap()
    }

    #[test]
    fn signed_integer_range_checks() {
        let mut f = int_field(8, true);
        assert!(matches!(f.set_signed(128), Err(Error::Invalid(_))));
        f.set_signed(127).unwrap();
        assert_eq!(f.signed_value().unwrap(), 127);
        f.set_signed(-128).unwrap();
        assert_eq!(f.signed_value().unwrap(), -128);
        assert!(matches!(f.set_signed(-129), Err(Error::Invalid(_))));
    }

    #[test]
    fn unsigned_integer_range_checks() {
        let mut f = int_field(8, false);
        assert!(matches!(f.set_unsigned(256), Err(Error::Invalid(_))));
        f.set_unsigned(255).unwrap();
        assert_eq!(f.unsigned_value().unwrap(), 255);

        let mut wide = int_field(64, false);
        wide.set_unsigned(u64::MAX).unwrap();
        assert_eq!(wide.unsigned_value().unwrap(), u64::MAX);
    }

    #[test]
    fn signedness_must_match_the_type() {
        let mut f = int_field(16, false);
        assert!(matches!(f.set_signed(1), Err(Error::Invalid(_))));
        let mut f = int_field(16, true);
        assert!(matches!(f.set_unsigned(1), Err(Error::Invalid(_))));
    }

    #[test]
    fn single_precision_float_rejects_lossy_values() {
        let mut f = Field::new(crate::schema::FloatType::new().into()).unwrap();
        let float = f.as_float_mut().unwrap();
        assert!(matches!(float.set(1.1_f64), Err(Error::Validation(_))));
        float.set(1.5).unwrap();
        assert_eq!(float.value().unwrap(), 1.5);
    }

    #[test]
    fn string_rejects_nul_and_grows() {
        let mut f = Field::new(StringType::new().into()).unwrap();
        let s = f.as_string_mut().unwrap();
        assert!(matches!(s.set("bad\0"), Err(Error::Validation(_))));
        s.set("hello").unwrap();
        s.append(", world").unwrap();
        s.append_with_length("!!!", 1).unwrap();
        assert_eq!(s.value().unwrap(), "hello, world!");
    }

    #[test]
    fn structure_children_are_lazy() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        st.add_field("b", IntegerType::new(8).unwrap().into()).unwrap();
        let mut f = Field::new(st.into()).unwrap();
        let s = f.as_struct_mut().unwrap();

        assert!(s.peek_field("a").is_none());
        s.field_by_name("a").unwrap().set_unsigned(1).unwrap();
        assert!(s.peek_field("a").is_some());
        assert!(matches!(
            s.field_by_name("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn validate_reports_unset_members() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        let mut f = Field::new(st.into()).unwrap();
        assert!(matches!(f.validate(), Err(Error::Validation(_))));
        f.as_struct_mut()
            .unwrap()
            .field_by_name("a")
            .unwrap()
            .set_unsigned(9)
            .unwrap();
        f.validate().unwrap();
    }

    #[test]
    fn reset_clears_payloads_but_keeps_shape() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        let mut f = Field::new(st.into()).unwrap();
        f.as_struct_mut()
            .unwrap()
            .field_by_name("a")
            .unwrap()
            .set_unsigned(9)
            .unwrap();
        f.reset();
        assert!(matches!(f.validate(), Err(Error::Validation(_))));
        // The child still exists; only its payload mark was cleared.
        assert!(f.as_struct().unwrap().peek_field("a").is_some());
    }

    #[test]
    fn sequence_requires_length_first() {
        let seq = SequenceType::new(IntegerType::new(8).unwrap().into(), "len").unwrap();
        let mut f = Field::new(seq.into()).unwrap();
        let s = f.as_sequence_mut().unwrap();
        assert!(matches!(s.field_at(0), Err(Error::Invalid(_))));
        s.set_length(2).unwrap();
        s.field_at(0).unwrap().set_unsigned(1).unwrap();
        s.field_at(1).unwrap().set_unsigned(2).unwrap();

        // Shrinking drops the tail, growing adds unset slots.
        s.set_length(1).unwrap();
        assert_eq!(s.length(), Some(1));
        s.set_length(3).unwrap();
        assert!(s.peek_at(0).is_some());
        assert!(s.peek_at(2).is_none());
    }

    #[test]
    fn variant_selection_by_tag() {
        let mut tag = EnumType::new(IntegerType::new(32).unwrap());
        tag.add_mapping("num", 0, 0).unwrap();
        tag.add_mapping("text", 1, 1).unwrap();

        let mut var = VariantType::new("tag").unwrap();
        var.add_option("num", IntegerType::new(32).unwrap().into()).unwrap();
        var.add_option("text", StringType::new().into()).unwrap();
        var.set_resolved_tag(
            crate::schema::FieldPath::new(crate::schema::Scope::EventPayload),
            tag,
        )
        .unwrap();

        let mut f = Field::new(var.into()).unwrap();
        let v = f.as_variant_mut().unwrap();
        assert!(matches!(v.selected_field(), Err(Error::Invalid(_))));

        v.set_tag_unsigned(1).unwrap().as_string_mut().unwrap().set("hi").unwrap();
        assert_eq!(v.selected_index(), Some(1));
        assert!(matches!(
            v.set_tag_unsigned(7),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn frozen_field_rejects_mutation() {
        let mut f = int_field(32, false);
        f.set_unsigned(5).unwrap();
        f.freeze();
        assert!(matches!(f.set_unsigned(6), Err(Error::Frozen(_))));
        assert_eq!(f.unsigned_value().unwrap(), 5);
    }

    #[test]
    fn lazy_children_of_frozen_composites_are_frozen() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        let mut f = Field::new(st.into()).unwrap();
        f.freeze();
        let child = f.as_struct_mut().unwrap().field_by_name("a").unwrap();
        assert!(matches!(child.set_unsigned(1), Err(Error::Frozen(_))));
    }

    #[test]
    fn set_field_checks_structural_type() {
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(32).unwrap().into()).unwrap();
        let mut f = Field::new(st.into()).unwrap();

        let mut replacement = int_field(32, false);
        replacement.set_unsigned(3).unwrap();
        f.as_struct_mut().unwrap().set_field("a", replacement).unwrap();

        let wrong = int_field(16, false);
        assert!(matches!(
            f.as_struct_mut().unwrap().set_field("a", wrong),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn array_bounds() {
        let arr = ArrayType::new(IntegerType::new(8).unwrap().into(), 2);
        let mut f = Field::new(arr.into()).unwrap();
        let a = f.as_array_mut().unwrap();
        a.field_at(0).unwrap().set_unsigned(1).unwrap();
        a.field_at(1).unwrap().set_unsigned(2).unwrap();
        assert!(matches!(a.field_at(2), Err(Error::Invalid(_))));
    }
}

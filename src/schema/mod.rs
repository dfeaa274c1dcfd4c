use crate::{clock::ClockClass, error::Error};
use byteordered::Endianness;
use internment::Intern;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use path::{FieldPath, Scope};

pub mod path;
pub mod resolve;

/// Native byte order of the system producing a trace's data streams.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NativeByteOrder {
    #[serde(alias = "little")]
    #[serde(alias = "le")]
    LittleEndian,
    #[serde(alias = "big")]
    #[serde(alias = "be")]
    BigEndian,
}

impl From<NativeByteOrder> for Endianness {
    fn from(value: NativeByteOrder) -> Self {
        match value {
            NativeByteOrder::LittleEndian => Endianness::Little,
            NativeByteOrder::BigEndian => Endianness::Big,
        }
    }
}

/// Byte order annotation carried by a field type. `Native` defers to
/// the owning trace's native byte order at serialization time.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    #[default]
    Native,
    LittleEndian,
    BigEndian,
    /// Network byte order, an alias for big endian.
    Network,
}

impl ByteOrder {
    /// Replaces `Native` with the trace's concrete byte order.
    pub fn resolve(self, native: Endianness) -> Endianness {
        match self {
            ByteOrder::Native => native,
            ByteOrder::LittleEndian => Endianness::Little,
            ByteOrder::BigEndian | ByteOrder::Network => Endianness::Big,
        }
    }
}

/// The preferred base (radix) to use when displaying integer values.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PreferredDisplayBase {
    #[serde(alias = "bin")]
    Binary,
    #[serde(alias = "oct")]
    Octal,
    #[default]
    #[serde(alias = "dec")]
    Decimal,
    #[serde(alias = "hex")]
    Hexadecimal,
}

/// Character encoding of integer and string field types.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    #[default]
    None,
    Utf8,
    Ascii,
}

/// Alignment of the first bit of a field type's instances within a CTF
/// packet (bits): 8 if the size is a multiple of 8, 1 otherwise.
const fn default_alignment_bits(size: u32) -> u32 {
    if size % 8 == 0 {
        8
    } else {
        1
    }
}

fn check_alignment(alignment: u32) -> Result<(), Error> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(Error::invalid(format!(
            "alignment must be a positive power of two, got {alignment}"
        )));
    }
    Ok(())
}

/// Integer field type: the type of integer data fields found in data
/// streams.
#[derive(Clone, Debug)]
pub struct IntegerType {
    frozen: bool,
    size: u32,
    alignment: u32,
    signed: bool,
    base: PreferredDisplayBase,
    byte_order: ByteOrder,
    encoding: Encoding,
    mapped_clock: Option<Arc<ClockClass>>,
}

impl IntegerType {
    /// Creates an unsigned integer type of `size` bits (1 to 64).
    pub fn new(size: u32) -> Result<Self, Error> {
        if size == 0 || size > 64 {
            return Err(Error::invalid(format!(
                "integer size must be within [1, 64] bits, got {size}"
            )));
        }
        Ok(Self {
            frozen: false,
            size,
            alignment: default_alignment_bits(size),
            signed: false,
            base: PreferredDisplayBase::default(),
            byte_order: ByteOrder::default(),
            encoding: Encoding::default(),
            mapped_clock: None,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn base(&self) -> PreferredDisplayBase {
        self.base
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn mapped_clock(&self) -> Option<&Arc<ClockClass>> {
        self.mapped_clock.as_ref()
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("integer field type"))
        } else {
            Ok(())
        }
    }

    pub fn set_signed(&mut self, signed: bool) -> Result<(), Error> {
        self.check_frozen()?;
        self.signed = signed;
        Ok(())
    }

    pub fn set_base(&mut self, base: PreferredDisplayBase) -> Result<(), Error> {
        self.check_frozen()?;
        self.base = base;
        Ok(())
    }

    pub fn set_byte_order(&mut self, byte_order: ByteOrder) -> Result<(), Error> {
        self.check_frozen()?;
        self.byte_order = byte_order;
        Ok(())
    }

    pub fn set_alignment(&mut self, alignment: u32) -> Result<(), Error> {
        self.check_frozen()?;
        check_alignment(alignment)?;
        self.alignment = alignment;
        Ok(())
    }

    /// Character encoding; an encoded integer must be 8 bits wide.
    pub fn set_encoding(&mut self, encoding: Encoding) -> Result<(), Error> {
        self.check_frozen()?;
        if encoding != Encoding::None && self.size != 8 {
            return Err(Error::invalid(format!(
                "only 8-bit integers may carry an encoding (size is {})",
                self.size
            )));
        }
        self.encoding = encoding;
        Ok(())
    }

    pub fn map_clock(&mut self, clock: Arc<ClockClass>) -> Result<(), Error> {
        self.check_frozen()?;
        self.mapped_clock = Some(clock);
        Ok(())
    }
}

impl PartialEq for IntegerType {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.alignment == other.alignment
            && self.signed == other.signed
            && self.base == other.base
            && self.byte_order == other.byte_order
            && self.encoding == other.encoding
            && self.mapped_clock.as_ref().map(|c| c.name())
                == other.mapped_clock.as_ref().map(|c| c.name())
    }
}

/// Floating point field type. Only the IEEE 754 binary32 (8/24) and
/// binary64 (11/53) digit splits are serializable.
#[derive(Clone, Debug)]
pub struct FloatType {
    frozen: bool,
    exponent_digits: u32,
    mantissa_digits: u32,
    alignment: u32,
    byte_order: ByteOrder,
}

impl FloatType {
    /// Creates a single-precision floating point type.
    pub fn new() -> Self {
        Self {
            frozen: false,
            exponent_digits: 8,
            mantissa_digits: 24,
            alignment: 8,
            byte_order: ByteOrder::default(),
        }
    }

    pub fn exponent_digits(&self) -> u32 {
        self.exponent_digits
    }

    pub fn mantissa_digits(&self) -> u32 {
        self.mantissa_digits
    }

    pub fn size(&self) -> u32 {
        self.exponent_digits + self.mantissa_digits
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn is_single_precision(&self) -> bool {
        self.exponent_digits == 8 && self.mantissa_digits == 24
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("floating point field type"))
        } else {
            Ok(())
        }
    }

    pub fn set_exponent_digits(&mut self, digits: u32) -> Result<(), Error> {
        self.check_frozen()?;
        if digits == 0 || digits + self.mantissa_digits > 64 {
            return Err(Error::invalid(format!(
                "exponent ({digits}) plus mantissa ({}) digits must be within [2, 64]",
                self.mantissa_digits
            )));
        }
        self.exponent_digits = digits;
        Ok(())
    }

    pub fn set_mantissa_digits(&mut self, digits: u32) -> Result<(), Error> {
        self.check_frozen()?;
        if digits == 0 || digits + self.exponent_digits > 64 {
            return Err(Error::invalid(format!(
                "exponent ({}) plus mantissa ({digits}) digits must be within [2, 64]",
                self.exponent_digits
            )));
        }
        self.mantissa_digits = digits;
        Ok(())
    }

    pub fn set_alignment(&mut self, alignment: u32) -> Result<(), Error> {
        self.check_frozen()?;
        check_alignment(alignment)?;
        self.alignment = alignment;
        Ok(())
    }

    pub fn set_byte_order(&mut self, byte_order: ByteOrder) -> Result<(), Error> {
        self.check_frozen()?;
        self.byte_order = byte_order;
        Ok(())
    }
}

impl Default for FloatType {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for FloatType {
    fn eq(&self, other: &Self) -> bool {
        self.exponent_digits == other.exponent_digits
            && self.mantissa_digits == other.mantissa_digits
            && self.alignment == other.alignment
            && self.byte_order == other.byte_order
    }
}

/// One mapping of an enumeration field type: a label covering an
/// inclusive value range. For an unsigned enumeration the bounds are
/// the two's complement bit patterns of the unsigned range.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EnumMapping {
    pub label: Intern<String>,
    pub lower: i64,
    pub upper: i64,
}

impl EnumMapping {
    pub(crate) fn contains_signed(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub(crate) fn contains_unsigned(&self, value: u64) -> bool {
        value >= self.lower as u64 && value <= self.upper as u64
    }
}

/// Enumeration field type over an integer container.
///
/// Duplicate labels are allowed and ranges may overlap; lookup by value
/// returns the first mapping whose range covers the value.
#[derive(Clone, Debug)]
pub struct EnumType {
    frozen: bool,
    container: Arc<FieldType>,
    mappings: Vec<EnumMapping>,
}

impl EnumType {
    pub fn new(container: IntegerType) -> Self {
        Self {
            frozen: false,
            container: Arc::new(FieldType::Integer(container)),
            mappings: Vec::new(),
        }
    }

    pub fn container(&self) -> &IntegerType {
        match self.container.as_ref() {
            FieldType::Integer(t) => t,
            _ => unreachable!("enumeration container is an integer type"),
        }
    }

    pub(crate) fn container_type(&self) -> &Arc<FieldType> {
        &self.container
    }

    pub fn is_signed(&self) -> bool {
        self.container().is_signed()
    }

    pub fn mappings(&self) -> &[EnumMapping] {
        &self.mappings
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("enumeration field type"))
        } else {
            Ok(())
        }
    }

    pub fn add_mapping<S: Into<String>>(
        &mut self,
        label: S,
        lower: i64,
        upper: i64,
    ) -> Result<(), Error> {
        self.check_frozen()?;
        if lower > upper {
            return Err(Error::invalid(format!(
                "enumeration mapping range is reversed ({lower} > {upper})"
            )));
        }
        self.mappings.push(EnumMapping {
            label: Intern::new(label.into()),
            lower,
            upper,
        });
        Ok(())
    }

    pub fn add_mapping_unsigned<S: Into<String>>(
        &mut self,
        label: S,
        lower: u64,
        upper: u64,
    ) -> Result<(), Error> {
        self.check_frozen()?;
        if lower > upper {
            return Err(Error::invalid(format!(
                "enumeration mapping range is reversed ({lower} > {upper})"
            )));
        }
        self.mappings.push(EnumMapping {
            label: Intern::new(label.into()),
            lower: lower as i64,
            upper: upper as i64,
        });
        Ok(())
    }

    pub fn mapping_for_signed(&self, value: i64) -> Option<&EnumMapping> {
        self.mappings.iter().find(|m| m.contains_signed(value))
    }

    pub fn mapping_for_unsigned(&self, value: u64) -> Option<&EnumMapping> {
        self.mappings.iter().find(|m| m.contains_unsigned(value))
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.mappings.iter().any(|m| m.label.as_str() == label)
    }
}

impl PartialEq for EnumType {
    fn eq(&self, other: &Self) -> bool {
        self.container == other.container && self.mappings == other.mappings
    }
}

/// String field type (NUL-terminated byte sequence on the wire).
#[derive(Clone, Debug)]
pub struct StringType {
    frozen: bool,
    encoding: Encoding,
}

impl StringType {
    pub fn new() -> Self {
        Self {
            frozen: false,
            encoding: Encoding::Utf8,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("string field type"));
        }
        if encoding == Encoding::None {
            return Err(Error::invalid("a string field type must be encoded"));
        }
        self.encoding = encoding;
        Ok(())
    }

    pub fn alignment(&self) -> u32 {
        8
    }
}

impl Default for StringType {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StringType {
    fn eq(&self, other: &Self) -> bool {
        self.encoding == other.encoding
    }
}

/// A named member of a structure or variant field type.
#[derive(Clone, Debug)]
pub struct NamedType {
    pub name: Intern<String>,
    pub ty: Arc<FieldType>,
}

impl PartialEq for NamedType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.ty == other.ty
    }
}

/// Structure field type: ordered named members.
#[derive(Clone, Debug)]
pub struct StructType {
    frozen: bool,
    minimum_alignment: u32,
    members: Vec<NamedType>,
}

impl StructType {
    pub fn new() -> Self {
        Self {
            frozen: false,
            minimum_alignment: 1,
            members: Vec::new(),
        }
    }

    pub fn members(&self) -> &[NamedType] {
        &self.members
    }

    pub fn field_count(&self) -> usize {
        self.members.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name.as_str() == name)
    }

    pub fn field_type_by_name(&self, name: &str) -> Option<&Arc<FieldType>> {
        self.members
            .iter()
            .find(|m| m.name.as_str() == name)
            .map(|m| &m.ty)
    }

    pub fn member_at(&self, index: usize) -> Option<&NamedType> {
        self.members.get(index)
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("structure field type"))
        } else {
            Ok(())
        }
    }

    pub fn add_field<S: Into<String>>(&mut self, name: S, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        let name = name.into();
        if self.field_index(&name).is_some() {
            return Err(Error::invalid(format!(
                "structure already has a field named '{name}'"
            )));
        }
        self.members.push(NamedType {
            name: Intern::new(name),
            ty: Arc::new(ty),
        });
        Ok(())
    }

    pub fn set_minimum_alignment(&mut self, alignment: u32) -> Result<(), Error> {
        self.check_frozen()?;
        check_alignment(alignment)?;
        self.minimum_alignment = alignment;
        Ok(())
    }

    /// Effective alignment: at least the declared minimum, and at least
    /// the largest member alignment.
    pub fn alignment(&self) -> u32 {
        self.members
            .iter()
            .map(|m| m.ty.alignment())
            .max()
            .unwrap_or(1)
            .max(self.minimum_alignment)
    }
}

impl Default for StructType {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StructType {
    fn eq(&self, other: &Self) -> bool {
        self.minimum_alignment == other.minimum_alignment && self.members == other.members
    }
}

/// Variant field type: a tagged union keyed by an enumeration
/// designated by a path string, resolved to a [`FieldPath`] when the
/// owning scope is attached to a trace.
#[derive(Clone, Debug)]
pub struct VariantType {
    frozen: bool,
    tag_path: String,
    tag_field_path: Option<FieldPath>,
    tag_type: Option<Box<EnumType>>,
    options: Vec<NamedType>,
}

impl VariantType {
    pub fn new<S: Into<String>>(tag_path: S) -> Result<Self, Error> {
        let tag_path = tag_path.into();
        if tag_path.is_empty() {
            return Err(Error::invalid("variant tag path is empty"));
        }
        Ok(Self {
            frozen: false,
            tag_path,
            tag_field_path: None,
            tag_type: None,
            options: Vec::new(),
        })
    }

    pub fn tag_path(&self) -> &str {
        &self.tag_path
    }

    pub fn tag_field_path(&self) -> Option<&FieldPath> {
        self.tag_field_path.as_ref()
    }

    /// The resolved tag enumeration, cached at resolution time to speed
    /// up option selection.
    pub fn tag_type(&self) -> Option<&EnumType> {
        self.tag_type.as_deref()
    }

    pub fn options(&self) -> &[NamedType] {
        &self.options
    }

    pub fn field_count(&self) -> usize {
        self.options.len()
    }

    pub fn option_index(&self, label: &str) -> Option<usize> {
        self.options.iter().position(|o| o.name.as_str() == label)
    }

    pub fn option_at(&self, index: usize) -> Option<&NamedType> {
        self.options.get(index)
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("variant field type"))
        } else {
            Ok(())
        }
    }

    pub fn add_option<S: Into<String>>(&mut self, label: S, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        let label = label.into();
        if self.option_index(&label).is_some() {
            return Err(Error::invalid(format!(
                "variant already has an option labelled '{label}'"
            )));
        }
        self.options.push(NamedType {
            name: Intern::new(label),
            ty: Arc::new(ty),
        });
        Ok(())
    }

    pub(crate) fn set_resolved_tag(
        &mut self,
        field_path: FieldPath,
        tag_type: EnumType,
    ) -> Result<(), Error> {
        self.check_frozen()?;
        self.tag_field_path = Some(field_path);
        self.tag_type = Some(Box::new(tag_type));
        Ok(())
    }

    /// Locates the option selected by a signed tag value through the
    /// resolved tag enumeration.
    pub fn option_index_for_tag_signed(&self, value: i64) -> Option<usize> {
        let tag = self.tag_type.as_deref()?;
        let mapping = tag.mapping_for_signed(value)?;
        self.option_index(mapping.label.as_str())
    }

    pub fn option_index_for_tag_unsigned(&self, value: u64) -> Option<usize> {
        let tag = self.tag_type.as_deref()?;
        let mapping = tag.mapping_for_unsigned(value)?;
        self.option_index(mapping.label.as_str())
    }
}

impl PartialEq for VariantType {
    fn eq(&self, other: &Self) -> bool {
        // Only the tag name takes part in structural equality: the
        // cached tag type may be replaced by a validated clone when the
        // owning scope is attached to a trace.
        self.tag_path == other.tag_path && self.options == other.options
    }
}

/// Array field type: a fixed number of elements of one type.
#[derive(Clone, Debug)]
pub struct ArrayType {
    frozen: bool,
    element: Arc<FieldType>,
    length: u32,
}

impl ArrayType {
    pub fn new(element: FieldType, length: u32) -> Self {
        Self {
            frozen: false,
            element: Arc::new(element),
            length,
        }
    }

    pub fn element_type(&self) -> &Arc<FieldType> {
        &self.element
    }

    pub fn length(&self) -> u32 {
        self.length
    }
}

impl PartialEq for ArrayType {
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length && self.element == other.element
    }
}

/// Sequence field type: a variable number of elements whose count is
/// carried by a preceding unsigned integer field designated by a path
/// string.
#[derive(Clone, Debug)]
pub struct SequenceType {
    frozen: bool,
    element: Arc<FieldType>,
    length_path: String,
    length_field_path: Option<FieldPath>,
}

impl SequenceType {
    pub fn new<S: Into<String>>(element: FieldType, length_path: S) -> Result<Self, Error> {
        let length_path = length_path.into();
        if length_path.is_empty() {
            return Err(Error::invalid("sequence length path is empty"));
        }
        Ok(Self {
            frozen: false,
            element: Arc::new(element),
            length_path,
            length_field_path: None,
        })
    }

    pub fn element_type(&self) -> &Arc<FieldType> {
        &self.element
    }

    pub fn length_path(&self) -> &str {
        &self.length_path
    }

    pub fn length_field_path(&self) -> Option<&FieldPath> {
        self.length_field_path.as_ref()
    }

    pub(crate) fn set_resolved_length(&mut self, field_path: FieldPath) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("sequence field type"));
        }
        self.length_field_path = Some(field_path);
        Ok(())
    }
}

impl PartialEq for SequenceType {
    fn eq(&self, other: &Self) -> bool {
        self.length_path == other.length_path && self.element == other.element
    }
}

/// A CTF field type: one of the nine constructors.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldType {
    Integer(IntegerType),
    Float(FloatType),
    Enum(EnumType),
    String(StringType),
    Struct(StructType),
    Variant(VariantType),
    Array(ArrayType),
    Sequence(SequenceType),
}

impl FieldType {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            FieldType::Integer(_) => "integer",
            FieldType::Float(_) => "floating point",
            FieldType::Enum(_) => "enumeration",
            FieldType::String(_) => "string",
            FieldType::Struct(_) => "structure",
            FieldType::Variant(_) => "variant",
            FieldType::Array(_) => "array",
            FieldType::Sequence(_) => "sequence",
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            FieldType::Struct(_) | FieldType::Variant(_) | FieldType::Array(_) | FieldType::Sequence(_)
        )
    }

    /// Alignment of the first bit of this type's instances (bits).
    pub fn alignment(&self) -> u32 {
        match self {
            FieldType::Integer(t) => t.alignment(),
            FieldType::Float(t) => t.alignment(),
            FieldType::Enum(t) => t.container().alignment(),
            FieldType::String(t) => t.alignment(),
            FieldType::Struct(t) => t.alignment(),
            FieldType::Variant(t) => t
                .options()
                .iter()
                .map(|o| o.ty.alignment())
                .max()
                .unwrap_or(1),
            FieldType::Array(t) => t.element_type().alignment(),
            FieldType::Sequence(t) => t.element_type().alignment(),
        }
    }

    /// Number of immediate children: members for structures, options
    /// for variants, one element type for arrays and sequences.
    pub fn field_count(&self) -> usize {
        match self {
            FieldType::Struct(t) => t.field_count(),
            FieldType::Variant(t) => t.field_count(),
            FieldType::Array(_) | FieldType::Sequence(_) => 1,
            _ => 0,
        }
    }

    /// Child type at a field-path index: `-1` addresses the element
    /// type of an array or sequence, non-negative indexes address
    /// structure members and variant options.
    pub fn child_at(&self, index: i32) -> Option<&Arc<FieldType>> {
        match self {
            FieldType::Struct(t) => t.member_at(usize::try_from(index).ok()?).map(|m| &m.ty),
            FieldType::Variant(t) => t.option_at(usize::try_from(index).ok()?).map(|o| &o.ty),
            FieldType::Array(t) => Some(t.element_type()),
            FieldType::Sequence(t) => Some(t.element_type()),
            _ => None,
        }
    }

    pub(crate) fn child_at_mut(&mut self, index: i32) -> Option<&mut Arc<FieldType>> {
        match self {
            FieldType::Struct(t) => t
                .members
                .get_mut(usize::try_from(index).ok()?)
                .map(|m| &mut m.ty),
            FieldType::Variant(t) => t
                .options
                .get_mut(usize::try_from(index).ok()?)
                .map(|o| &mut o.ty),
            FieldType::Array(t) => Some(&mut t.element),
            FieldType::Sequence(t) => Some(&mut t.element),
            _ => None,
        }
    }

    /// Index of a named child in a structure or variant.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            FieldType::Struct(t) => t.field_index(name),
            FieldType::Variant(t) => t.option_index(name),
            _ => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            FieldType::Integer(t) => t.frozen,
            FieldType::Float(t) => t.frozen,
            FieldType::Enum(t) => t.frozen,
            FieldType::String(t) => t.frozen,
            FieldType::Struct(t) => t.frozen,
            FieldType::Variant(t) => t.frozen,
            FieldType::Array(t) => t.frozen,
            FieldType::Sequence(t) => t.frozen,
        }
    }

    /// Marks this type and every descendant immutable.
    pub fn freeze(&mut self) {
        if self.is_frozen() {
            return;
        }
        match self {
            FieldType::Integer(t) => t.frozen = true,
            FieldType::Float(t) => t.frozen = true,
            FieldType::String(t) => t.frozen = true,
            FieldType::Enum(t) => {
                t.frozen = true;
                freeze_child(&mut t.container);
            }
            FieldType::Struct(t) => {
                t.frozen = true;
                for member in t.members.iter_mut() {
                    freeze_child(&mut member.ty);
                }
            }
            FieldType::Variant(t) => {
                t.frozen = true;
                if let Some(tag) = t.tag_type.as_mut() {
                    tag.frozen = true;
                    freeze_child(&mut tag.container);
                }
                for option in t.options.iter_mut() {
                    freeze_child(&mut option.ty);
                }
            }
            FieldType::Array(t) => {
                t.frozen = true;
                freeze_child(&mut t.element);
            }
            FieldType::Sequence(t) => {
                t.frozen = true;
                freeze_child(&mut t.element);
            }
        }
    }

    /// Checks the per-constructor invariants, recursively.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            FieldType::Integer(t) => {
                if t.encoding != Encoding::None && t.size != 8 {
                    return Err(Error::invalid(
                        "encoded integer field types must be 8 bits wide",
                    ));
                }
                Ok(())
            }
            FieldType::Float(t) => {
                if t.exponent_digits + t.mantissa_digits > 64 {
                    return Err(Error::invalid(format!(
                        "floating point digits exceed 64 bits ({} + {})",
                        t.exponent_digits, t.mantissa_digits
                    )));
                }
                Ok(())
            }
            FieldType::Enum(t) => {
                if t.mappings.is_empty() {
                    return Err(Error::invalid("enumeration field type has no mapping"));
                }
                t.container.validate()
            }
            FieldType::String(_) => Ok(()),
            FieldType::Struct(t) => {
                for member in t.members.iter() {
                    member.ty.validate()?;
                }
                Ok(())
            }
            FieldType::Variant(t) => {
                if t.options.is_empty() {
                    return Err(Error::invalid("variant field type has no option"));
                }
                for option in t.options.iter() {
                    option.ty.validate()?;
                }
                Ok(())
            }
            FieldType::Array(t) => t.element.validate(),
            FieldType::Sequence(t) => t.element.validate(),
        }
    }

    pub fn as_integer(&self) -> Option<&IntegerType> {
        match self {
            FieldType::Integer(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatType> {
        match self {
            FieldType::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumType> {
        match self {
            FieldType::Enum(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&StringType> {
        match self {
            FieldType::String(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            FieldType::Struct(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&VariantType> {
        match self {
            FieldType::Variant(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match self {
            FieldType::Array(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceType> {
        match self {
            FieldType::Sequence(t) => Some(t),
            _ => None,
        }
    }
}

/// Freezes an `Arc`'d child in place. A shared, not-yet-frozen child is
/// copied on write so freezing never leaks through independent owners.
fn freeze_child(child: &mut Arc<FieldType>) {
    if child.is_frozen() {
        return;
    }
    Arc::make_mut(child).freeze();
}

impl From<IntegerType> for FieldType {
    fn from(t: IntegerType) -> Self {
        FieldType::Integer(t)
    }
}

impl From<FloatType> for FieldType {
    fn from(t: FloatType) -> Self {
        FieldType::Float(t)
    }
}

impl From<EnumType> for FieldType {
    fn from(t: EnumType) -> Self {
        FieldType::Enum(t)
    }
}

impl From<StringType> for FieldType {
    fn from(t: StringType) -> Self {
        FieldType::String(t)
    }
}

impl From<StructType> for FieldType {
    fn from(t: StructType) -> Self {
        FieldType::Struct(t)
    }
}

impl From<VariantType> for FieldType {
    fn from(t: VariantType) -> Self {
        FieldType::Variant(t)
    }
}

impl From<ArrayType> for FieldType {
    fn from(t: ArrayType) -> Self {
        FieldType::Array(t)
    }
}

impl From<SequenceType> for FieldType {
    fn from(t: SequenceType) -> Self {
        FieldType::Sequence(t)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn u32_type() -> IntegerType {
        IntegerType::new(32).unwrap()
    }

    #[test]
    fn integer_size_bounds() {
        assert!(IntegerType::new(0).is_err());
        assert!(IntegerType::new(65).is_err());
        assert!(IntegerType::new(1).is_ok());
        assert!(IntegerType::new(64).is_ok());
    }

    #[test]
    fn integer_default_alignment_follows_size() {
        assert_eq!(IntegerType::new(32).unwrap().alignment(), 8);
        assert_eq!(IntegerType::new(27).unwrap().alignment(), 1);
    }

    #[test]
    fn encoded_integer_must_be_a_byte() {
        let mut t = u32_type();
        assert!(matches!(
            t.set_encoding(Encoding::Utf8),
            Err(Error::Invalid(_))
        ));
        let mut t = IntegerType::new(8).unwrap();
        t.set_encoding(Encoding::Ascii).unwrap();
    }

    #[test]
    fn frozen_type_rejects_every_mutator() {
        let mut ty = FieldType::Integer(u32_type());
        ty.freeze();
        let t = match &mut ty {
            FieldType::Integer(t) => t,
            _ => unreachable!(),
        };
        assert!(matches!(t.set_signed(true), Err(Error::Frozen(_))));
        assert!(matches!(t.set_alignment(16), Err(Error::Frozen(_))));
        assert!(matches!(
            t.set_base(PreferredDisplayBase::Hexadecimal),
            Err(Error::Frozen(_))
        ));
    }

    #[test]
    fn freeze_is_transitive() {
        let mut inner = StructType::new();
        inner.add_field("a", u32_type().into()).unwrap();
        let mut outer = StructType::new();
        outer.add_field("in", inner.into()).unwrap();
        let mut ty = FieldType::Struct(outer);
        ty.freeze();

        let inner_ty = ty.child_at(0).unwrap();
        assert!(inner_ty.is_frozen());
        assert!(inner_ty.child_at(0).unwrap().is_frozen());
    }

    #[test]
    fn structure_names_are_unique() {
        let mut st = StructType::new();
        st.add_field("x", u32_type().into()).unwrap();
        assert!(matches!(
            st.add_field("x", u32_type().into()),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn structure_alignment_covers_members() {
        let mut wide = u32_type();
        wide.set_alignment(64).unwrap();
        let mut st = StructType::new();
        st.add_field("a", IntegerType::new(8).unwrap().into()).unwrap();
        st.add_field("b", wide.into()).unwrap();
        assert_eq!(st.alignment(), 64);
    }

    #[test]
    fn variant_compares_tag_by_name_only() {
        let mut a = VariantType::new("tag").unwrap();
        a.add_option("x", u32_type().into()).unwrap();
        let mut b = VariantType::new("tag").unwrap();
        b.add_option("x", u32_type().into()).unwrap();

        // Attach a resolved tag type to one side only.
        let mut tag = EnumType::new(u32_type());
        tag.add_mapping("x", 0, 0).unwrap();
        a.set_resolved_tag(FieldPath::new(Scope::EventPayload), tag)
            .unwrap();

        assert_eq!(FieldType::Variant(a), FieldType::Variant(b));
    }

    #[test]
    fn enum_lookup_returns_first_covering_mapping() {
        let mut e = EnumType::new(u32_type());
        e.add_mapping("low", 0, 10).unwrap();
        e.add_mapping("overlap", 5, 15).unwrap();
        assert_eq!(e.mapping_for_unsigned(7).unwrap().label.as_str(), "low");
        assert_eq!(e.mapping_for_unsigned(12).unwrap().label.as_str(), "overlap");
        assert!(e.mapping_for_unsigned(16).is_none());
    }

    #[test]
    fn byte_order_resolution() {
        assert_eq!(
            ByteOrder::Native.resolve(Endianness::Little),
            Endianness::Little
        );
        assert_eq!(
            ByteOrder::Network.resolve(Endianness::Little),
            Endianness::Big
        );
        assert_eq!(
            ByteOrder::BigEndian.resolve(Endianness::Little),
            Endianness::Big
        );
    }

    #[test]
    fn float_digit_budget() {
        let mut f = FloatType::new();
        f.set_exponent_digits(11).unwrap();
        f.set_mantissa_digits(53).unwrap();
        assert!(matches!(
            f.set_mantissa_digits(54),
            Err(Error::Invalid(_))
        ));
    }
}

//! Schema model (C2): the in-memory representation of the declarative type
//! system a [`crate::schema::loader`] populates and [`crate::engine`] walks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{Endian, StringEncoding};
use crate::error::{Error, Result};
use crate::schema::expr::Expr;

/// How a template-parameterized field's concrete type is bound at the call
/// site. Binding is purely structural (schema + enclosing field), never a
/// function of field *values*, so both the reader and the writer derive the
/// same binding independently and the round-trip guarantee is unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateBinding {
    /// Bind the parameter to a concrete, named type.
    Concrete(String),
    /// Propagate whichever type the *enclosing* generic compound was itself
    /// bound to under this parameter name (nested generics).
    Outer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicKind {
    Int,
    Float,
    Char,
}

#[derive(Debug, Clone)]
pub struct BasicType {
    pub name: String,
    pub bytes: u8,
    pub signed: bool,
    pub kind: BasicKind,
    pub endian_override: Option<Endian>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub underlying: String,
    pub is_bitflags: bool,
    /// Declaration order preserved; `Schema::enum_value_name` does the
    /// reverse integer-to-name lookup.
    pub values: Vec<(String, i64)>,
}

impl EnumDef {
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BitfieldSubfield {
    pub name: String,
    pub width: u8,
}

#[derive(Debug, Clone)]
pub struct BitfieldDef {
    pub name: String,
    pub underlying: String,
    /// Packing order for subfields within the underlying integer.
    pub msb_first: bool,
    pub fields: Vec<BitfieldSubfield>,
}

impl BitfieldDef {
    /// Extract every subfield's value out of the packed `raw` integer, LSB
    /// first unless `msb_first`, per spec.md §4.4. `total_bits` is the
    /// underlying basic type's width (`8 * BasicType::bytes`); it only
    /// matters for `msb_first` packing, where subfield placement is
    /// measured from the top of the storage unit rather than from bit 0.
    pub fn unpack(&self, raw: u64, total_bits: u32) -> Vec<(String, u64)> {
        let mut out = Vec::with_capacity(self.fields.len());
        let mut bit = 0u32;
        for sub in &self.fields {
            let mask = Self::mask(sub.width);
            let shift = self.shift_of(bit, sub.width, total_bits);
            let value = (raw >> shift) & mask;
            out.push((sub.name.clone(), value));
            bit += sub.width as u32;
        }
        out
    }

    /// Inverse of [`BitfieldDef::unpack`]: pack `(name, value)` pairs (any
    /// order, by name) back into the underlying integer. Unknown names are
    /// ignored; missing ones pack as zero.
    pub fn pack(&self, values: &[(String, u64)], total_bits: u32) -> u64 {
        let mut raw = 0u64;
        let mut bit = 0u32;
        for sub in &self.fields {
            let mask = Self::mask(sub.width);
            let value = values
                .iter()
                .find(|(n, _)| n == &sub.name)
                .map(|(_, v)| *v & mask)
                .unwrap_or(0);
            let shift = self.shift_of(bit, sub.width, total_bits);
            raw |= value << shift;
            bit += sub.width as u32;
        }
        raw
    }

    fn mask(width: u8) -> u64 {
        if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        }
    }

    fn shift_of(&self, bit_offset: u32, width: u8, total_bits: u32) -> u64 {
        if self.msb_first {
            (total_bits - bit_offset - width as u32) as u64
        } else {
            bit_offset as u64
        }
    }

    pub fn subfield_width(&self, name: &str) -> Option<u8> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.width)
    }
}

#[derive(Debug, Clone)]
pub enum FieldType {
    Basic(String),
    Enum(String),
    Bitfield(String),
    Compound(String),
    /// Stands for the enclosing generic compound's parameter of this name;
    /// only valid inside a compound whose `generic_params` contains it.
    TemplateParam(String),
    Reference {
        /// Declared static target compound, if the schema pins one down.
        /// `None` means "any compound" (an untyped/void pointer slot).
        target: Option<String>,
        strong: bool,
        width: u8,
    },
    StringField(StringEncoding),
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    /// 1-D array length, or `None` for a scalar field.
    pub length: Option<Expr>,
    /// Inner (per-element) length for a 2-D jagged array.
    pub length2: Option<Expr>,
    pub default: Option<i64>,
    pub version_from: Option<Expr>,
    pub version_to: Option<Expr>,
    pub user_version_from: Option<Expr>,
    pub user_version_to: Option<Expr>,
    pub condition: Option<Expr>,
    pub template_binding: Option<TemplateBinding>,
}

impl Field {
    pub fn is_array(&self) -> bool {
        self.length.is_some()
    }

    pub fn is_2d_array(&self) -> bool {
        self.length2.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Compound {
    pub name: String,
    pub parent: Option<String>,
    pub generic_params: Vec<String>,
    pub generic: bool,
    /// Fully flattened: parent's fields first, then this compound's own.
    pub fields: Vec<Field>,
    /// Index into `fields` where this compound's own fields start (the
    /// prefix before it came from `parent`). Kept for diagnostics only, per
    /// spec.md's "preserve a parent pointer for diagnostics".
    pub own_fields_start: usize,
}

impl Compound {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionFormat {
    /// Byte shift for each of the four dotted components, most significant
    /// first. Default is `[24, 16, 8, 0]`, i.e. `(a<<24)|(b<<16)|(c<<8)|d`.
    pub shifts: [u32; 4],
}

impl Default for VersionFormat {
    fn default() -> Self {
        VersionFormat {
            shifts: [24, 16, 8, 0],
        }
    }
}

impl VersionFormat {
    pub fn pack(&self, parts: [u32; 4]) -> u32 {
        let mut out = 0u32;
        for (part, shift) in parts.iter().zip(self.shifts) {
            out |= (part & 0xFF) << shift;
        }
        out
    }

    /// Parse a dotted version string (`"20.2.0.7"`) into its packed form.
    pub fn parse(&self, dotted: &str) -> Result<u32> {
        let mut parts = [0u32; 4];
        let mut count = 0;
        for (i, piece) in dotted.split('.').enumerate() {
            if i >= 4 {
                return Err(Error::SchemaError(vec![(
                    Default::default(),
                    format!("version string {dotted:?} has more than 4 components"),
                )]));
            }
            parts[i] = piece.parse::<u32>().map_err(|_| {
                Error::SchemaError(vec![(
                    Default::default(),
                    format!("invalid version component {piece:?} in {dotted:?}"),
                )])
            })?;
            count += 1;
        }
        if count == 0 {
            return Err(Error::SchemaError(vec![(
                Default::default(),
                format!("empty version string {dotted:?}"),
            )]));
        }
        Ok(self.pack(parts))
    }
}

#[derive(Debug, Default)]
pub(crate) struct SchemaData {
    pub basics: HashMap<String, BasicType>,
    pub enums: HashMap<String, EnumDef>,
    pub bitfields: HashMap<String, BitfieldDef>,
    pub compounds: HashMap<String, Compound>,
    pub version_format: VersionFormat,
}

/// An immutable, cheaply-`Clone`-able schema. Per spec.md §5, schemas are
/// shareable across every `BlockGraph` loaded with them; the `Arc` makes
/// that sharing free.
#[derive(Debug, Clone)]
pub struct Schema {
    pub(crate) data: Arc<SchemaData>,
}

impl Schema {
    pub fn basic(&self, name: &str) -> Option<&BasicType> {
        self.data.basics.get(name)
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.data.enums.get(name)
    }

    pub fn bitfield_def(&self, name: &str) -> Option<&BitfieldDef> {
        self.data.bitfields.get(name)
    }

    /// Decode a bitfield's packed subfields, looking up its underlying
    /// storage width to get `msb_first` packing right. `None` if `name`
    /// isn't a known bitfield or its declared storage type is missing.
    pub fn bitfield_subfields(&self, name: &str, raw: u64) -> Option<Vec<(String, u64)>> {
        let def = self.bitfield_def(name)?;
        let storage = self.basic(&def.underlying)?;
        Some(def.unpack(raw, storage.bytes as u32 * 8))
    }

    pub fn compound(&self, name: &str) -> Option<&Compound> {
        self.data.compounds.get(name)
    }

    pub fn version_format(&self) -> VersionFormat {
        self.data.version_format
    }

    pub fn compound_names(&self) -> impl Iterator<Item = &str> {
        self.data.compounds.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_version_format_packs_dotted_components() {
        let packed = VersionFormat::default().pack([20, 2, 0, 7]);
        insta::assert_debug_snapshot!(packed, @"335675399");
        assert_eq!(VersionFormat::default().parse("20.2.0.7").unwrap(), packed);
    }

    #[test]
    fn bitfield_unpack_lsb_first_round_trips() {
        let def = BitfieldDef {
            name: "Flags".to_string(),
            underlying: "byte".to_string(),
            msb_first: false,
            fields: vec![
                BitfieldSubfield { name: "low".to_string(), width: 3 },
                BitfieldSubfield { name: "mid".to_string(), width: 4 },
                BitfieldSubfield { name: "hi".to_string(), width: 1 },
            ],
        };
        let raw = 0b1_0110_101u64; // hi=1 mid=0110 low=101
        let subs = def.unpack(raw, 8);
        assert_eq!(subs, vec![
            ("low".to_string(), 0b101),
            ("mid".to_string(), 0b0110),
            ("hi".to_string(), 0b1),
        ]);
        assert_eq!(def.pack(&subs, 8), raw);
    }

    #[test]
    fn bitfield_unpack_msb_first_measures_from_storage_top() {
        let def = BitfieldDef {
            name: "Flags".to_string(),
            underlying: "byte".to_string(),
            msb_first: true,
            fields: vec![
                BitfieldSubfield { name: "a".to_string(), width: 2 },
                BitfieldSubfield { name: "b".to_string(), width: 6 },
            ],
        };
        // a occupies bits [6,7], b occupies bits [0,5]
        let raw = 0b10_101010u64;
        let subs = def.unpack(raw, 8);
        assert_eq!(subs[0], ("a".to_string(), 0b10));
        assert_eq!(subs[1], ("b".to_string(), 0b101010));
        assert_eq!(def.pack(&subs, 8), raw);
    }
}

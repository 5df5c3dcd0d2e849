//! Schema loader (C3): parses the declarative XML schema source into a
//! [`Schema`], in the raw-then-cooked two-stage style used throughout this
//! crate's teacher for its own type descriptors — read the wire/declarative
//! form into an unresolved `Raw*` struct first, then resolve names and
//! expressions into the real [`crate::schema::model`] entities in a second
//! pass.
//!
//! Source dialect (deliberately small, loosely in the spirit of the
//! block/niobject schemas this kernel targets):
//!
//! ```xml
//! <schema version_shifts="24,16,8,0">
//!   <basic name="uint" bytes="4"/>
//!   <basic name="float" bytes="4" kind="float"/>
//!   <enum name="TexType" storage="uint">
//!     <option name="BASE" value="0"/>
//!   </enum>
//!   <bitflags name="Flags" storage="uint">
//!     <option name="HIDDEN" value="1"/>
//!   </bitflags>
//!   <bitfield name="Packed" storage="byte">
//!     <field name="a" width="4"/>
//!   </bitfield>
//!   <compound name="Base">
//!     <field name="id" type="uint"/>
//!   </compound>
//!   <compound name="Node" inherit="Base" generic="T">
//!     <field name="child" type="ref" target="Node" weak="false"/>
//!     <field name="name" type="string" encoding="sized"/>
//!     <field name="items" type="T" template="T" arr1="count"/>
//!   </compound>
//! </schema>
//! ```

use std::collections::{HashMap, HashSet};
use std::io::Read;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::codec::{Endian, StringEncoding};
use crate::error::{Error, Result, SchemaPos};
use crate::schema::expr::{self, Expr};
use crate::schema::model::{
    BasicKind, BasicType, BitfieldDef, BitfieldSubfield, Compound, EnumDef, Field, FieldType,
    Schema, SchemaData, TemplateBinding, VersionFormat,
};

/// Parse a schema source string into an immutable [`Schema`]. Every
/// structural problem (unknown type, inheritance cycle, bad expression) is
/// collected rather than failing on the first one, then reported together
/// as a single [`Error::SchemaError`].
pub fn load_schema(xml: &str) -> Result<Schema> {
    let mut errs = Vec::new();
    let raw = parse_raw(xml, &mut errs);
    if !errs.is_empty() {
        return Err(Error::SchemaError(errs));
    }
    let data = cook(raw, &mut errs)?;
    if !errs.is_empty() {
        return Err(Error::SchemaError(errs));
    }
    Ok(Schema {
        data: std::sync::Arc::new(data),
    })
}

impl Schema {
    /// Convenience alias for [`load_schema`], named to match the rest of
    /// this crate's `from_str`/`from_reader` constructor pairs.
    pub fn from_str(xml: &str) -> Result<Schema> {
        load_schema(xml)
    }

    /// Read an entire schema source from `reader` and parse it. Schema
    /// sources are small declarative documents, never a streamed format, so
    /// buffering the whole thing up front is the right tradeoff.
    pub fn from_reader(reader: &mut impl Read) -> Result<Schema> {
        let mut xml = String::new();
        reader
            .read_to_string(&mut xml)
            .map_err(|e| Error::from_io(0, e))?;
        load_schema(&xml)
    }
}

struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn build(source: &str) -> LineIndex {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineIndex { line_starts }
    }

    fn pos(&self, offset: usize) -> SchemaPos {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let column = offset.saturating_sub(self.line_starts[line]);
        SchemaPos {
            line: line as u32 + 1,
            column: column as u32 + 1,
        }
    }
}

fn attr(tag: &BytesStart, name: &str) -> Option<String> {
    tag.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

fn parse_int_literal(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<i64>().ok()
    }
}

struct RawEnum {
    pos: SchemaPos,
    name: String,
    storage: String,
    bitflags: bool,
    options: Vec<(String, i64)>,
}

struct RawBitfield {
    pos: SchemaPos,
    name: String,
    storage: String,
    msb_first: bool,
    fields: Vec<BitfieldSubfield>,
}

struct RawField {
    pos: SchemaPos,
    name: String,
    type_name: String,
    ref_weak: Option<bool>,
    ref_target: Option<String>,
    ref_width: u8,
    string_encoding: Option<StringEncoding>,
    arr1: Option<String>,
    arr2: Option<String>,
    cond: Option<String>,
    ver1: Option<String>,
    ver2: Option<String>,
    userver1: Option<String>,
    userver2: Option<String>,
    default: Option<i64>,
    template: Option<String>,
}

struct RawCompound {
    pos: SchemaPos,
    name: String,
    inherit: Option<String>,
    generic_params: Vec<String>,
    fields: Vec<RawField>,
}

#[derive(Default)]
struct RawSchema {
    version_format: VersionFormat,
    basics: Vec<(SchemaPos, BasicType)>,
    enums: Vec<RawEnum>,
    bitfields: Vec<RawBitfield>,
    compounds: Vec<RawCompound>,
}

fn parse_raw(xml: &str, errs: &mut Vec<(SchemaPos, String)>) -> RawSchema {
    let lines = LineIndex::build(xml);
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut out = RawSchema::default();
    let mut buf = Vec::new();

    // Element we're currently inside, for nested <option>/<field> children.
    enum Ctx {
        None,
        Enum(usize),
        Bitfield(usize),
        Compound(usize),
    }
    let mut ctx = Ctx::None;

    loop {
        let offset = reader.buffer_position();
        let pos = lines.pos(offset as usize);
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(tag)) | Ok(Event::Empty(tag)) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                match name.as_str() {
                    "schema" => {
                        if let Some(shifts) = attr(&tag, "version_shifts") {
                            match parse_shifts(&shifts) {
                                Some(s) => out.version_format = VersionFormat { shifts: s },
                                None => errs.push((
                                    pos,
                                    format!("malformed version_shifts {shifts:?}"),
                                )),
                            }
                        }
                    }
                    "basic" => match read_basic(&tag, pos) {
                        Ok(b) => out.basics.push((pos, b)),
                        Err(e) => errs.push((pos, e)),
                    },
                    "enum" | "bitflags" => {
                        let storage = attr(&tag, "storage").unwrap_or_else(|| "uint".into());
                        let enum_name = match attr(&tag, "name") {
                            Some(n) => n,
                            None => {
                                errs.push((pos, "enum/bitflags missing name".into()));
                                continue;
                            }
                        };
                        out.enums.push(RawEnum {
                            pos,
                            name: enum_name,
                            storage,
                            bitflags: name == "bitflags",
                            options: Vec::new(),
                        });
                        ctx = Ctx::Enum(out.enums.len() - 1);
                    }
                    "option" => {
                        let opt_name = attr(&tag, "name");
                        let opt_value = attr(&tag, "value").or_else(|| attr(&tag, "bit"));
                        let is_bit = attr(&tag, "bit").is_some();
                        match (&ctx, opt_name, opt_value) {
                            (Ctx::Enum(idx), Some(n), Some(v)) => {
                                let raw_value = if is_bit {
                                    parse_int_literal(&v).map(|b| 1i64 << b)
                                } else {
                                    parse_int_literal(&v)
                                };
                                match raw_value {
                                    Some(value) => out.enums[*idx].options.push((n, value)),
                                    None => errs.push((pos, format!("bad option value {v:?}"))),
                                }
                            }
                            _ => errs.push((pos, "<option> outside <enum>/<bitflags>".into())),
                        }
                    }
                    "bitfield" => {
                        let storage = attr(&tag, "storage").unwrap_or_else(|| "uint".into());
                        let bf_name = match attr(&tag, "name") {
                            Some(n) => n,
                            None => {
                                errs.push((pos, "bitfield missing name".into()));
                                continue;
                            }
                        };
                        let msb_first = attr(&tag, "msb_first")
                            .map(|v| v == "true")
                            .unwrap_or(false);
                        out.bitfields.push(RawBitfield {
                            pos,
                            name: bf_name,
                            storage,
                            msb_first,
                            fields: Vec::new(),
                        });
                        ctx = Ctx::Bitfield(out.bitfields.len() - 1);
                    }
                    "compound" | "niobject" => {
                        let c_name = match attr(&tag, "name") {
                            Some(n) => n,
                            None => {
                                errs.push((pos, "compound missing name".into()));
                                continue;
                            }
                        };
                        let inherit = attr(&tag, "inherit");
                        let generic_params = attr(&tag, "generic")
                            .map(|g| g.split(',').map(|s| s.trim().to_string()).collect())
                            .unwrap_or_default();
                        out.compounds.push(RawCompound {
                            pos,
                            name: c_name,
                            inherit,
                            generic_params,
                            fields: Vec::new(),
                        });
                        ctx = Ctx::Compound(out.compounds.len() - 1);
                    }
                    "field" => match &ctx {
                        Ctx::Compound(idx) => match read_field(&tag, pos) {
                            Ok(f) => out.compounds[*idx].fields.push(f),
                            Err(e) => errs.push((pos, e)),
                        },
                        Ctx::Bitfield(idx) => {
                            let f_name = attr(&tag, "name");
                            let width = attr(&tag, "width").and_then(|w| w.parse::<u8>().ok());
                            match (f_name, width) {
                                (Some(name), Some(width)) => {
                                    out.bitfields[*idx]
                                        .fields
                                        .push(BitfieldSubfield { name, width });
                                }
                                _ => errs.push((pos, "bitfield <field> needs name and width".into())),
                            }
                        }
                        _ => errs.push((pos, "<field> outside <compound>/<bitfield>".into())),
                    },
                    other => errs.push((pos, format!("unknown element <{other}>"))),
                }
            }
            Ok(Event::End(tag)) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                if matches!(name.as_str(), "enum" | "bitflags" | "bitfield" | "compound" | "niobject") {
                    ctx = Ctx::None;
                }
            }
            Ok(_) => {}
            Err(e) => {
                errs.push((pos, format!("xml parse error: {e}")));
                break;
            }
        }
        buf.clear();
    }
    out
}

fn parse_shifts(s: &str) -> Option<[u32; 4]> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if parts.len() != 4 {
        return None;
    }
    Some([parts[0], parts[1], parts[2], parts[3]])
}

fn read_basic(tag: &BytesStart, pos: SchemaPos) -> std::result::Result<BasicType, String> {
    let name = attr(tag, "name").ok_or("basic missing name")?;
    let bytes = attr(tag, "bytes")
        .and_then(|b| b.parse::<u8>().ok())
        .ok_or("basic missing/bad bytes")?;
    let kind = match attr(tag, "kind").as_deref() {
        Some("float") => BasicKind::Float,
        Some("char") => BasicKind::Char,
        _ => BasicKind::Int,
    };
    let signed = attr(tag, "signed").map(|v| v == "true").unwrap_or(false);
    let endian_override = match attr(tag, "endian").as_deref() {
        Some("big") => Some(Endian::Big),
        Some("little") => Some(Endian::Little),
        _ => None,
    };
    let _ = pos;
    Ok(BasicType {
        name,
        bytes,
        signed,
        kind,
        endian_override,
    })
}

fn read_field(tag: &BytesStart, pos: SchemaPos) -> std::result::Result<RawField, String> {
    let name = attr(tag, "name").ok_or("field missing name")?;
    let type_name = attr(tag, "type").ok_or("field missing type")?;

    let (ref_weak, ref_target, ref_width) = if type_name == "ref" {
        let weak = attr(tag, "weak").map(|v| v == "true").unwrap_or(false);
        let target = attr(tag, "target");
        let width = attr(tag, "width")
            .and_then(|w| w.parse::<u8>().ok())
            .unwrap_or(4);
        (Some(weak), target, width)
    } else {
        (None, None, 4)
    };

    let string_encoding = if type_name == "string" {
        Some(match attr(tag, "encoding").as_deref() {
            Some("short") => StringEncoding::Short,
            Some("sized") | None => StringEncoding::Sized,
            Some(other) if other.starts_with("fixed:") => {
                let n = other["fixed:".len()..]
                    .parse::<u32>()
                    .map_err(|_| format!("bad fixed string length in {other:?}"))?;
                StringEncoding::FixedLen(n)
            }
            Some(other) if other.starts_with("prefix:") => {
                let n = other["prefix:".len()..]
                    .parse::<u8>()
                    .map_err(|_| format!("bad prefix width in {other:?}"))?;
                StringEncoding::LengthPrefixed { prefix_bytes: n }
            }
            Some(other) => return Err(format!("unknown string encoding {other:?}")),
        })
    } else {
        None
    };

    let default = attr(tag, "default").and_then(|d| parse_int_literal(&d));

    Ok(RawField {
        pos,
        name,
        type_name,
        ref_weak,
        ref_target,
        ref_width,
        string_encoding,
        arr1: attr(tag, "arr1"),
        arr2: attr(tag, "arr2"),
        cond: attr(tag, "cond"),
        ver1: attr(tag, "ver1"),
        ver2: attr(tag, "ver2"),
        userver1: attr(tag, "userver1"),
        userver2: attr(tag, "userver2"),
        default,
        template: attr(tag, "template"),
    })
}

/// Resolve a `ver1`/`ver2`/`userver1`/`userver2` attribute into the literal
/// threshold it denotes: either a dotted version string (`"20.2.0.7"`,
/// resolved through the schema's [`VersionFormat`]) or a bare integer.
fn parse_version_bound(s: &str, fmt: &VersionFormat) -> std::result::Result<Expr, String> {
    if s.contains('.') {
        fmt.parse(s)
            .map(Expr::Lit)
            .map_err(|e| format!("bad version bound {s:?}: {e}"))
    } else {
        parse_int_literal(s)
            .map(Expr::Lit)
            .ok_or_else(|| format!("bad version bound {s:?}"))
    }
}

fn cook(raw: RawSchema, errs: &mut Vec<(SchemaPos, String)>) -> Result<SchemaData> {
    let mut data = SchemaData {
        version_format: raw.version_format,
        ..Default::default()
    };

    for (pos, basic) in raw.basics {
        if data.basics.insert(basic.name.clone(), basic).is_some() {
            errs.push((pos, "duplicate basic definition".into()));
        }
    }

    for e in raw.enums {
        if !data.basics.contains_key(&e.storage) {
            errs.push((
                e.pos,
                format!("enum {:?} has unknown storage type {:?}", e.name, e.storage),
            ));
        }
        let def = EnumDef {
            name: e.name.clone(),
            underlying: e.storage,
            is_bitflags: e.bitflags,
            values: e.options,
        };
        if data.enums.insert(e.name.clone(), def).is_some() {
            errs.push((e.pos, format!("duplicate enum {:?}", e.name)));
        }
    }

    for b in raw.bitfields {
        if !data.basics.contains_key(&b.storage) {
            errs.push((
                b.pos,
                format!("bitfield {:?} has unknown storage type {:?}", b.name, b.storage),
            ));
        }
        let total: u32 = b.fields.iter().map(|f| f.width as u32).sum();
        if let Some(basic) = data.basics.get(&b.storage) {
            if total > basic.bytes as u32 * 8 {
                errs.push((
                    b.pos,
                    format!(
                        "bitfield {:?} subfields use {total} bits, storage only has {}",
                        b.name,
                        basic.bytes as u32 * 8
                    ),
                ));
            }
        }
        let def = BitfieldDef {
            name: b.name.clone(),
            underlying: b.storage,
            msb_first: b.msb_first,
            fields: b.fields,
        };
        if data.bitfields.insert(b.name.clone(), def).is_some() {
            errs.push((b.pos, format!("duplicate bitfield {:?}", b.name)));
        }
    }

    let raw_compounds: HashMap<String, RawCompound> = raw
        .compounds
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();

    let mut cooked: HashMap<String, Compound> = HashMap::new();
    let mut resolving: HashSet<String> = HashSet::new();
    let names: Vec<String> = raw_compounds.keys().cloned().collect();
    for name in names {
        cook_compound(&name, &raw_compounds, &mut data, &mut cooked, &mut resolving, errs);
    }
    data.compounds = cooked;

    Ok(data)
}

#[allow(clippy::too_many_arguments)]
fn cook_compound(
    name: &str,
    raw_compounds: &HashMap<String, RawCompound>,
    data: &mut SchemaData,
    cooked: &mut HashMap<String, Compound>,
    resolving: &mut HashSet<String>,
    errs: &mut Vec<(SchemaPos, String)>,
) {
    if cooked.contains_key(name) {
        return;
    }
    let Some(raw) = raw_compounds.get(name) else {
        return;
    };
    if !resolving.insert(name.to_string()) {
        errs.push((raw.pos, format!("inheritance cycle involving {name:?}")));
        return;
    }

    let mut fields = Vec::new();
    let mut own_fields_start = 0;
    if let Some(parent) = &raw.inherit {
        cook_compound(parent, raw_compounds, data, cooked, resolving, errs);
        match cooked.get(parent) {
            Some(parent_compound) => {
                fields = parent_compound.fields.clone();
                own_fields_start = fields.len();
            }
            None => {
                if !raw_compounds.contains_key(parent) {
                    errs.push((
                        raw.pos,
                        format!("compound {name:?} inherits unknown compound {parent:?}"),
                    ));
                }
            }
        }
    }

    let generic = !raw.generic_params.is_empty();
    for rf in &raw.fields {
        if let Some(field) = cook_field(rf, name, &raw.generic_params, raw_compounds, data, errs) {
            fields.push(field);
        }
    }

    cooked.insert(
        name.to_string(),
        Compound {
            name: name.to_string(),
            parent: raw.inherit.clone(),
            generic_params: raw.generic_params.clone(),
            generic,
            fields,
            own_fields_start,
        },
    );
    resolving.remove(name);
}

fn cook_field(
    rf: &RawField,
    owner: &str,
    generic_params: &[String],
    raw_compounds: &HashMap<String, RawCompound>,
    data: &SchemaData,
    errs: &mut Vec<(SchemaPos, String)>,
) -> Option<Field> {
    let ty = if generic_params.contains(&rf.type_name) {
        FieldType::TemplateParam(rf.type_name.clone())
    } else if rf.type_name == "ref" {
        FieldType::Reference {
            target: rf.ref_target.clone(),
            strong: !rf.ref_weak.unwrap_or(false),
            width: rf.ref_width,
        }
    } else if rf.type_name == "string" {
        FieldType::StringField(rf.string_encoding.unwrap_or(StringEncoding::Sized))
    } else if data.basics.contains_key(&rf.type_name) {
        FieldType::Basic(rf.type_name.clone())
    } else if data.enums.contains_key(&rf.type_name) {
        FieldType::Enum(rf.type_name.clone())
    } else if data.bitfields.contains_key(&rf.type_name) {
        FieldType::Bitfield(rf.type_name.clone())
    } else if raw_compounds.contains_key(&rf.type_name) {
        FieldType::Compound(rf.type_name.clone())
    } else {
        errs.push((
            rf.pos,
            format!(
                "field {:?} of {owner:?} has unknown type {:?}",
                rf.name, rf.type_name
            ),
        ));
        return None;
    };

    let template_binding = rf.template.as_ref().map(|t| {
        if generic_params.contains(t) {
            TemplateBinding::Outer(t.clone())
        } else {
            TemplateBinding::Concrete(t.clone())
        }
    });

    let mut ok = true;
    let mut compile = |src: &Option<String>| -> Option<Expr> {
        src.as_ref().and_then(|s| match expr::parse(s) {
            Ok(e) => Some(e),
            Err(e) => {
                errs.push((rf.pos, format!("field {:?}: {e}", rf.name)));
                ok = false;
                None
            }
        })
    };
    let length = compile(&rf.arr1);
    let length2 = compile(&rf.arr2);
    let condition = compile(&rf.cond);

    let mut version_bound = |src: &Option<String>| -> Option<Expr> {
        src.as_ref().and_then(|s| match parse_version_bound(s, &data.version_format) {
            Ok(e) => Some(e),
            Err(msg) => {
                errs.push((rf.pos, format!("field {:?}: {msg}", rf.name)));
                ok = false;
                None
            }
        })
    };
    let version_from = version_bound(&rf.ver1);
    let version_to = version_bound(&rf.ver2);
    let user_version_from = version_bound(&rf.userver1);
    let user_version_to = version_bound(&rf.userver2);

    if !ok {
        return None;
    }

    Some(Field {
        name: rf.name.clone(),
        ty,
        length,
        length2,
        default: rf.default,
        version_from,
        version_to,
        user_version_from,
        user_version_to,
        condition,
        template_binding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <schema>
          <basic name="byte" bytes="1"/>
          <basic name="uint" bytes="4"/>
          <enum name="Kind" storage="uint">
            <option name="A" value="0"/>
            <option name="B" value="1"/>
          </enum>
          <compound name="Base">
            <field name="id" type="uint"/>
          </compound>
          <compound name="Node" inherit="Base">
            <field name="kind" type="Kind"/>
            <field name="count" type="uint"/>
            <field name="items" type="uint" arr1="count"/>
            <field name="child" type="ref" target="Node"/>
            <field name="name" type="string" encoding="sized"/>
          </compound>
        </schema>
    "#;

    #[test]
    fn loads_and_flattens_inheritance() {
        let schema = load_schema(SAMPLE).unwrap();
        let node = schema.compound("Node").unwrap();
        assert_eq!(node.own_fields_start, 1);
        assert_eq!(node.fields[0].name, "id");
        assert_eq!(node.fields[1].name, "kind");
        assert!(matches!(node.fields[1].ty, FieldType::Enum(ref n) if n == "Kind"));
        assert!(node.fields[3].is_array());
        assert!(matches!(node.fields[4].ty, FieldType::Reference { strong: true, .. }));
    }

    #[test]
    fn unknown_type_is_reported() {
        let bad = r#"<schema><compound name="X"><field name="f" type="Bogus"/></compound></schema>"#;
        let err = load_schema(bad).unwrap_err();
        match err {
            Error::SchemaError(msgs) => assert!(!msgs.is_empty()),
            other => panic!("expected SchemaError, got {other:?}"),
        }
    }

    #[test]
    fn inheritance_cycle_is_reported() {
        let bad = r#"
            <schema>
              <compound name="A" inherit="B"/>
              <compound name="B" inherit="A"/>
            </schema>
        "#;
        assert!(load_schema(bad).is_err());
    }
}

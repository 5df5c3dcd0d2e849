//! Serializer/deserializer (C6): walks a [`Compound`] in declared field
//! order, gating each field by version/user_version/condition, resolving
//! template parameters, and reading or writing the corresponding [`Value`].

use std::io::{Read, Write};

use crate::codec::{ByteReader, ByteWriter, Endian};
use crate::error::{Error, Result};
use crate::schema::model::{BasicKind, Field, FieldType, Schema, TemplateBinding};
use crate::schema::{Expr, Scope};
use crate::value::{ArrayValue, Instance, Link, LinkTarget, Value};

/// Non-fatal problem noticed while reading or writing; the caller still gets
/// a fully-formed graph. Per the round-trip guarantee, the *values* that
/// produce a warning are preserved verbatim (e.g. an enum's unrecognized raw
/// value is kept, not coerced), only the observation is surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning(pub String);

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ReadCtx<'a> {
    pub schema: &'a Schema,
    pub version: u32,
    pub user_version: u32,
    pub endian: Endian,
    pub warnings: &'a mut Vec<Warning>,
}

pub struct WriteCtx<'a> {
    pub schema: &'a Schema,
    pub version: u32,
    pub user_version: u32,
    pub endian: Endian,
}

fn resolve_named_type(schema: &Schema, name: &str) -> Option<FieldType> {
    if schema.basic(name).is_some() {
        Some(FieldType::Basic(name.to_string()))
    } else if schema.enum_def(name).is_some() {
        Some(FieldType::Enum(name.to_string()))
    } else if schema.bitfield_def(name).is_some() {
        Some(FieldType::Bitfield(name.to_string()))
    } else if schema.compound(name).is_some() {
        Some(FieldType::Compound(name.to_string()))
    } else {
        None
    }
}

fn field_template_arg(field: &Field, compound_template_arg: Option<&str>) -> Option<String> {
    match &field.template_binding {
        Some(TemplateBinding::Concrete(t)) => Some(t.clone()),
        Some(TemplateBinding::Outer(_)) => compound_template_arg.map(|s| s.to_string()),
        None => None,
    }
}

fn scalar_template_arg(field: &Field, compound_template_arg: Option<&str>) -> Option<String> {
    match &field.ty {
        FieldType::Compound(_) => field_template_arg(field, compound_template_arg),
        FieldType::TemplateParam(_) => compound_template_arg.map(|s| s.to_string()),
        _ => None,
    }
}

/// Read one compound instance, fully resolving its flattened field list.
/// `template_arg` is the concrete type bound to this compound's own generic
/// parameter when it was instantiated by an enclosing field, if any.
pub fn read_compound<R: Read>(
    ctx: &mut ReadCtx,
    reader: &mut R,
    compound_name: &str,
    template_arg: Option<&str>,
) -> Result<Instance> {
    let compound = ctx
        .schema
        .compound(compound_name)
        .ok_or_else(|| Error::UnknownType(compound_name.to_string()))?
        .clone();

    let field_names: Vec<String> = compound.fields.iter().map(|f| f.name.clone()).collect();
    let mut instance = Instance::with_field_names(compound_name.to_string(), field_names);

    for (idx, field) in compound.fields.iter().enumerate() {
        let value = read_field(ctx, reader, field, &instance, template_arg)?;
        instance.set_field(idx, value);
    }
    Ok(instance)
}

fn gate(
    field: &Field,
    scope: &Scope,
    version: u32,
    user_version: u32,
) -> Result<bool> {
    if let Some(from) = &field.version_from {
        if version < from.eval(scope)? as u32 {
            return Ok(false);
        }
    }
    if let Some(to) = &field.version_to {
        if version > to.eval(scope)? as u32 {
            return Ok(false);
        }
    }
    if let Some(from) = &field.user_version_from {
        if user_version < from.eval(scope)? as u32 {
            return Ok(false);
        }
    }
    if let Some(to) = &field.user_version_to {
        if user_version > to.eval(scope)? as u32 {
            return Ok(false);
        }
    }
    if let Some(cond) = &field.condition {
        if !cond.eval_bool(scope)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_field<R: Read>(
    ctx: &mut ReadCtx,
    reader: &mut R,
    field: &Field,
    instance_so_far: &Instance,
    compound_template_arg: Option<&str>,
) -> Result<Option<Value>> {
    let scope = Scope::new(instance_so_far, ctx.version, ctx.user_version);
    if !gate(field, &scope, ctx.version, ctx.user_version)? {
        return Ok(field.default.map(Value::Int));
    }

    let template_arg = scalar_template_arg(field, compound_template_arg);

    if field.is_array() {
        let count = field.length.as_ref().unwrap().eval(&scope)?;
        if count < 0 {
            return Err(Error::CorruptBlock(format!(
                "field {:?} has negative array length {count}",
                field.name
            )));
        }
        let count = count as usize;
        if let Some(len2) = &field.length2 {
            // Each row's inner length is evaluated independently, against a
            // scope scoped to that row, so a jagged array whose row lengths
            // come from a parallel per-row length field (rather than one
            // shared length) reads back the shape it was written in.
            let mut items = Vec::new();
            let mut row_lengths = Vec::with_capacity(count);
            for row in 0..count {
                let row_scope = Scope::with_row(instance_so_far, ctx.version, ctx.user_version, row);
                let row_len = len2.eval(&row_scope)?;
                if row_len < 0 {
                    return Err(Error::CorruptBlock(format!(
                        "field {:?} row {row} has negative length {row_len}",
                        field.name
                    )));
                }
                let row_len = row_len as usize;
                for _ in 0..row_len {
                    items.push(read_field_type(ctx, reader, &field.ty, template_arg.as_deref())?);
                }
                row_lengths.push(row_len);
            }
            Ok(Some(Value::Array(ArrayValue {
                items,
                row_lengths: Some(row_lengths),
            })))
        } else {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_field_type(ctx, reader, &field.ty, template_arg.as_deref())?);
            }
            Ok(Some(Value::Array(ArrayValue::flat(items))))
        }
    } else {
        Ok(Some(read_field_type(ctx, reader, &field.ty, template_arg.as_deref())?))
    }
}

fn read_field_type<R: Read>(
    ctx: &mut ReadCtx,
    reader: &mut R,
    ty: &FieldType,
    template_arg: Option<&str>,
) -> Result<Value> {
    match ty {
        FieldType::Basic(name) => {
            let basic = ctx
                .schema
                .basic(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?
                .clone();
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            Ok(match basic.kind {
                BasicKind::Float => match basic.bytes {
                    4 => Value::Float(reader.read_f32(endian)? as f64),
                    8 => Value::Float(reader.read_f64(endian)?),
                    other => {
                        return Err(Error::CorruptBlock(format!(
                            "unsupported float width {other} for {name:?}"
                        )))
                    }
                },
                BasicKind::Int | BasicKind::Char => {
                    let raw = reader.read_int(basic.bytes, basic.signed, endian)?;
                    if basic.signed {
                        Value::Int(raw)
                    } else {
                        Value::UInt(raw as u64)
                    }
                }
            })
        }
        FieldType::Enum(name) => {
            let def = ctx
                .schema
                .enum_def(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?
                .clone();
            let basic = ctx
                .schema
                .basic(&def.underlying)
                .ok_or_else(|| Error::UnknownType(def.underlying.clone()))?
                .clone();
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            let raw = reader.read_int(basic.bytes, basic.signed, endian)?;
            if def.is_bitflags {
                let known: i64 = def.values.iter().fold(0, |acc, (_, v)| acc | v);
                if raw & !known != 0 {
                    ctx.warnings.push(Warning(format!(
                        "enum {name:?} raw value {raw:#x} has bits outside any declared flag"
                    )));
                }
            } else if def.name_of(raw).is_none() {
                ctx.warnings.push(Warning(format!(
                    "enum {name:?} has unrecognized value {raw}, preserving raw"
                )));
            }
            Ok(Value::EnumValue {
                enum_name: name.clone(),
                raw,
            })
        }
        FieldType::Bitfield(name) => {
            let def = ctx
                .schema
                .bitfield_def(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?
                .clone();
            let basic = ctx
                .schema
                .basic(&def.underlying)
                .ok_or_else(|| Error::UnknownType(def.underlying.clone()))?
                .clone();
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            let raw = reader.read_int(basic.bytes, false, endian)? as u64;
            Ok(Value::BitfieldValue {
                def_name: name.clone(),
                raw,
            })
        }
        FieldType::Compound(name) => {
            let instance = read_compound(ctx, reader, name, template_arg)?;
            Ok(Value::Instance(Box::new(instance)))
        }
        FieldType::TemplateParam(param) => {
            let arg = template_arg
                .ok_or_else(|| Error::UnknownType(format!("unbound template parameter {param}")))?;
            let resolved = resolve_named_type(ctx.schema, arg)
                .ok_or_else(|| Error::UnknownType(arg.to_string()))?;
            read_field_type(ctx, reader, &resolved, None)
        }
        FieldType::Reference {
            target: _,
            strong,
            width,
        } => {
            let raw = reader.read_int(*width, true, ctx.endian)?;
            let target = if raw < 0 {
                LinkTarget::Null
            } else {
                LinkTarget::Unresolved(raw)
            };
            Ok(Value::Link(Link {
                strong: *strong,
                target,
            }))
        }
        FieldType::StringField(encoding) => {
            let bytes = reader.read_string(*encoding, ctx.endian)?;
            Ok(Value::Str(bytes))
        }
    }
}

/// Write one compound instance back out. The caller guarantees `instance`
/// was produced (directly or via [`crate::graph`] mutation) against the
/// same schema; fields this version/user_version gates out are skipped
/// exactly as they were on read, so a value present-but-inapplicable in
/// `instance` never reappears on the wire.
pub fn write_compound<W: Write>(
    ctx: &WriteCtx,
    writer: &mut W,
    compound_name: &str,
    instance: &Instance,
    template_arg: Option<&str>,
) -> Result<()> {
    let compound = ctx
        .schema
        .compound(compound_name)
        .ok_or_else(|| Error::UnknownType(compound_name.to_string()))?
        .clone();

    for (idx, field) in compound.fields.iter().enumerate() {
        write_field(ctx, writer, field, instance, idx, template_arg)?;
    }
    Ok(())
}

fn write_field<W: Write>(
    ctx: &WriteCtx,
    writer: &mut W,
    field: &Field,
    instance: &Instance,
    idx: usize,
    compound_template_arg: Option<&str>,
) -> Result<()> {
    let scope = Scope::new(instance, ctx.version, ctx.user_version);
    if !gate(field, &scope, ctx.version, ctx.user_version)? {
        return Ok(());
    }
    let Some(value) = instance.fields[idx].as_ref() else {
        return Ok(());
    };

    let template_arg = scalar_template_arg(field, compound_template_arg);

    match value {
        Value::Array(arr) => {
            for item in &arr.items {
                write_field_type(ctx, writer, &field.ty, item, template_arg.as_deref())?;
            }
            Ok(())
        }
        other => write_field_type(ctx, writer, &field.ty, other, template_arg.as_deref()),
    }
}

fn type_error(field: &str, declared: &str, value: &Value) -> Error {
    Error::TypeError {
        field: field.to_string(),
        declared: declared.to_string(),
        value_kind: value.kind_name().to_string(),
    }
}

fn write_field_type<W: Write>(
    ctx: &WriteCtx,
    writer: &mut W,
    ty: &FieldType,
    value: &Value,
    template_arg: Option<&str>,
) -> Result<()> {
    match ty {
        FieldType::Basic(name) => {
            let basic = ctx
                .schema
                .basic(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            match basic.kind {
                BasicKind::Float => {
                    let f = match value {
                        Value::Float(f) => *f,
                        Value::Int(i) => *i as f64,
                        other => return Err(type_error(name, "float", other)),
                    };
                    match basic.bytes {
                        4 => writer.write_f32(f as f32, endian),
                        8 => writer.write_f64(f, endian),
                        other => Err(Error::CorruptBlock(format!(
                            "unsupported float width {other} for {name:?}"
                        ))),
                    }
                }
                BasicKind::Int | BasicKind::Char => {
                    let v = match value {
                        Value::Int(i) => *i,
                        Value::UInt(u) => *u as i64,
                        other => return Err(type_error(name, "int", other)),
                    };
                    writer.write_int(v, basic.bytes, endian)
                }
            }
        }
        FieldType::Enum(name) => {
            let def = ctx
                .schema
                .enum_def(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            let basic = ctx
                .schema
                .basic(&def.underlying)
                .ok_or_else(|| Error::UnknownType(def.underlying.clone()))?;
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            let raw = match value {
                Value::EnumValue { raw, .. } => *raw,
                other => return Err(type_error(name, "enum", other)),
            };
            writer.write_int(raw, basic.bytes, endian)
        }
        FieldType::Bitfield(name) => {
            let def = ctx
                .schema
                .bitfield_def(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            let basic = ctx
                .schema
                .basic(&def.underlying)
                .ok_or_else(|| Error::UnknownType(def.underlying.clone()))?;
            let endian = basic.endian_override.unwrap_or(ctx.endian);
            let raw = match value {
                Value::BitfieldValue { raw, .. } => *raw as i64,
                other => return Err(type_error(name, "bitfield", other)),
            };
            writer.write_int(raw, basic.bytes, endian)
        }
        FieldType::Compound(name) => {
            let inner = value
                .as_instance()
                .ok_or_else(|| type_error(name, "compound", value))?;
            write_compound(ctx, writer, name, inner, template_arg)
        }
        FieldType::TemplateParam(param) => {
            let arg = template_arg
                .ok_or_else(|| Error::UnknownType(format!("unbound template parameter {param}")))?;
            let resolved = resolve_named_type(ctx.schema, arg)
                .ok_or_else(|| Error::UnknownType(arg.to_string()))?;
            write_field_type(ctx, writer, &resolved, value, None)
        }
        FieldType::Reference { width, .. } => {
            let link = value
                .as_link()
                .ok_or_else(|| type_error("link", "reference", value))?;
            let raw = match link.target {
                LinkTarget::Null => -1,
                LinkTarget::Resolved(id) => id.0 as i64,
                LinkTarget::Unresolved(idx) => idx,
            };
            writer.write_int(raw, *width, ctx.endian)
        }
        FieldType::StringField(encoding) => {
            let bytes = match value {
                Value::Str(b) => b,
                other => return Err(type_error("string", "string", other)),
            };
            writer.write_string(bytes, *encoding, ctx.endian)
        }
    }
}

/// Evaluate `expr` against a fully-populated instance without the
/// surrounding read/write machinery. Used by [`crate::graph`] when it needs
/// a compound's length/condition result outside of a field-by-field walk
/// (e.g. re-checking a condition after a mutation).
pub fn eval_against(expr: &Expr, instance: &Instance, version: u32, user_version: u32) -> Result<i64> {
    let scope = Scope::new(instance, version, user_version);
    expr.eval(&scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::loader::load_schema;
    use std::io::Cursor;

    const SCHEMA: &str = r#"
        <schema>
          <basic name="byte" bytes="1"/>
          <basic name="uint" bytes="4"/>
          <enum name="Kind" storage="uint">
            <option name="A" value="0"/>
            <option name="B" value="1"/>
          </enum>
          <compound name="Item">
            <field name="count" type="uint"/>
            <field name="values" type="uint" arr1="count"/>
            <field name="kind" type="Kind" ver1="4"/>
          </compound>
        </schema>
    "#;

    const JAGGED_SCHEMA: &str = r#"
        <schema>
          <basic name="uint" bytes="4"/>
          <compound name="Jagged">
            <field name="row_count" type="uint"/>
            <field name="row_lengths" type="uint" arr1="row_count"/>
            <field name="rows" type="uint" arr1="row_count" arr2="row_lengths"/>
          </compound>
        </schema>
    "#;

    #[test]
    fn jagged_array_uses_independent_per_row_lengths() {
        let schema = load_schema(JAGGED_SCHEMA).unwrap();
        let mut bytes = Vec::new();
        bytes.write_u32(3, Endian::Little).unwrap(); // row_count
        bytes.write_u32(1, Endian::Little).unwrap();
        bytes.write_u32(3, Endian::Little).unwrap();
        bytes.write_u32(2, Endian::Little).unwrap(); // row_lengths = [1, 3, 2]
        for v in [10, 20, 21, 22, 30, 31] {
            bytes.write_u32(v, Endian::Little).unwrap();
        }
        let mut warnings = Vec::new();
        let mut ctx = ReadCtx {
            schema: &schema,
            version: 0,
            user_version: 0,
            endian: Endian::Little,
            warnings: &mut warnings,
        };
        let mut cur = Cursor::new(bytes.clone());
        let instance = read_compound(&mut ctx, &mut cur, "Jagged", None).unwrap();

        let rows_value = instance.field("rows").unwrap().as_array().unwrap();
        assert_eq!(rows_value.row_lengths.as_ref().unwrap(), &vec![1, 3, 2]);
        let rows = rows_value.rows();
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[1].len(), 3);
        assert_eq!(rows[2].len(), 2);
        assert_eq!(rows[1][1].as_i64(), Some(21));

        let mut out = Vec::new();
        let wctx = WriteCtx {
            schema: &schema,
            version: 0,
            user_version: 0,
            endian: Endian::Little,
        };
        write_compound(&wctx, &mut out, "Jagged", &instance, None).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn reads_array_and_gated_field() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut bytes = Vec::new();
        bytes.write_u32(2, Endian::Little).unwrap();
        bytes.write_u32(10, Endian::Little).unwrap();
        bytes.write_u32(20, Endian::Little).unwrap();
        // no `kind` bytes: version below ver1 gates it out
        let mut warnings = Vec::new();
        let mut ctx = ReadCtx {
            schema: &schema,
            version: 2,
            user_version: 0,
            endian: Endian::Little,
            warnings: &mut warnings,
        };
        let mut cur = Cursor::new(bytes);
        let instance = read_compound(&mut ctx, &mut cur, "Item", None).unwrap();
        assert_eq!(instance.field("count").unwrap().as_i64(), Some(2));
        let arr = instance.field("values").unwrap().as_array().unwrap();
        assert_eq!(arr.items.len(), 2);
        assert!(instance.fields[2].is_none());
    }

    #[test]
    fn roundtrips_with_version_gate_satisfied() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut bytes = Vec::new();
        bytes.write_u32(1, Endian::Little).unwrap();
        bytes.write_u32(99, Endian::Little).unwrap();
        bytes.write_u32(1, Endian::Little).unwrap(); // Kind::B
        let mut warnings = Vec::new();
        let mut ctx = ReadCtx {
            schema: &schema,
            version: 4,
            user_version: 0,
            endian: Endian::Little,
            warnings: &mut warnings,
        };
        let mut cur = Cursor::new(bytes.clone());
        let instance = read_compound(&mut ctx, &mut cur, "Item", None).unwrap();

        let mut out = Vec::new();
        let wctx = WriteCtx {
            schema: &schema,
            version: 4,
            user_version: 0,
            endian: Endian::Little,
        };
        write_compound(&wctx, &mut out, "Item", &instance, None).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn unknown_enum_value_preserved_with_warning() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut bytes = Vec::new();
        bytes.write_u32(0, Endian::Little).unwrap();
        bytes.write_u32(77, Endian::Little).unwrap(); // unrecognized Kind value
        let mut warnings = Vec::new();
        let mut ctx = ReadCtx {
            schema: &schema,
            version: 4,
            user_version: 0,
            endian: Endian::Little,
            warnings: &mut warnings,
        };
        let mut cur = Cursor::new(bytes);
        let instance = read_compound(&mut ctx, &mut cur, "Item", None).unwrap();
        match instance.field("kind") {
            Some(Value::EnumValue { raw, .. }) => assert_eq!(*raw, 77),
            other => panic!("expected preserved enum value, got {other:?}"),
        }
        assert_eq!(warnings.len(), 1);
    }
}

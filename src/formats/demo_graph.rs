//! Synthetic "BFG1" block-graph format.
//!
//! Exercises the framing C7 is responsible for in full: a block type table,
//! a string table interned through [`BlockGraph::intern_string`], strong and
//! weak links, and a version-gated field. This is the format spec.md §8's
//! cycle-tolerance, insert-parent, unknown-enum and link-mismatch scenarios
//! run against.
//!
//! On-disk layout, all integers little-endian:
//!
//! ```text
//! "BFG1"                  4-byte signature
//! version: u32
//! user_version: u32
//! num_types: u32
//! num_types x short-string compound name
//! num_blocks: u32
//! num_blocks x { type_index: u32, <compound body> }
//! num_roots: u32
//! num_roots x block_index: u32
//! ```

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;

use crate::codec::{ByteReader, ByteWriter, Endian, StringEncoding};
use crate::engine::{self, ReadCtx, Warning, WriteCtx};
use crate::error::{Error, Result};
use crate::graph::BlockGraph;
use crate::registry::{FormatBinding, LoadReport};
use crate::schema::loader::load_schema;
use crate::schema::model::Schema;
use crate::value::{BlockId, StringId};

pub const SIGNATURE: &[u8] = b"BFG1";

const SCHEMA_XML: &str = r#"
    <schema>
      <basic name="byte" bytes="1"/>
      <basic name="uint" bytes="4"/>
      <enum name="NodeKind" storage="uint">
        <option name="Empty" value="0"/>
        <option name="Mesh" value="1"/>
      </enum>
      <compound name="Leaf">
        <field name="value" type="uint"/>
      </compound>
      <compound name="Mesh">
        <field name="name" type="string" encoding="short"/>
      </compound>
      <compound name="Texture">
        <field name="name" type="string" encoding="short"/>
      </compound>
      <compound name="Holder">
        <field name="mesh" type="ref" target="Mesh"/>
      </compound>
      <compound name="Node">
        <field name="kind" type="NodeKind" ver1="2"/>
        <field name="label" type="string" encoding="short"/>
        <field name="strong_child" type="ref" target="Node"/>
        <field name="weak_back" type="ref" target="Node" weak="true"/>
      </compound>
    </schema>
"#;

pub fn schema() -> Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA
        .get_or_init(|| load_schema(SCHEMA_XML).expect("demo graph schema is well-formed"))
        .clone()
}

pub fn decode(bytes: &[u8]) -> Result<LoadReport> {
    let mut warnings = Vec::new();
    let mut cur = Cursor::new(bytes);

    let mut sig = [0u8; 4];
    cur.read_exact(&mut sig)
        .map_err(|e| Error::from_io(4, e))?;
    if sig != *SIGNATURE {
        return Err(Error::CorruptBlock("bad BFG1 signature".to_string()));
    }
    let version = cur.read_u32(Endian::Little)?;
    let user_version = cur.read_u32(Endian::Little)?;

    let schema = schema();
    let mut graph = BlockGraph::new(schema.clone(), version, user_version, Endian::Little);

    let num_types = cur.read_u32(Endian::Little)? as usize;
    let mut type_ids: Vec<StringId> = Vec::with_capacity(num_types);
    for _ in 0..num_types {
        let raw = cur.read_string(StringEncoding::Short, Endian::Little)?;
        std::str::from_utf8(&raw)
            .map_err(|_| Error::CorruptBlock("non-utf8 block type name".to_string()))?;
        type_ids.push(graph.intern_string(raw));
    }

    let num_blocks = cur.read_u32(Endian::Little)? as usize;
    for _ in 0..num_blocks {
        let type_index = cur.read_u32(Endian::Little)? as usize;
        let string_id = *type_ids.get(type_index).ok_or_else(|| {
            Error::CorruptBlock(format!("block type index {type_index} out of range"))
        })?;
        // Resolved (not kept borrowed) before `graph` needs mutating below.
        let compound_name = graph
            .resolve_string(string_id)
            .ok_or_else(|| Error::CorruptBlock("dangling block type string id".to_string()))?
            .into_owned();
        let mut ctx = ReadCtx {
            schema: &schema,
            version,
            user_version,
            endian: Endian::Little,
            warnings: &mut warnings,
        };
        let instance = engine::read_compound(&mut ctx, &mut cur, &compound_name, None)?;
        graph.push_block(instance);
    }

    let num_roots = cur.read_u32(Endian::Little)? as usize;
    let mut roots = Vec::with_capacity(num_roots);
    for _ in 0..num_roots {
        roots.push(BlockId(cur.read_u32(Endian::Little)?));
    }
    graph.set_roots(roots);

    warnings.extend(graph.resolve_links()?);

    let remaining = bytes.len() as u64 - cur.position();
    if remaining > 0 {
        log::warn!("{remaining} trailing byte(s) after the last declared block, tolerating");
        warnings.push(Warning(format!(
            "{remaining} trailing byte(s) after the last declared block"
        )));
    }
    log::debug!(
        "loaded BFG1: {} block(s), {} root(s), version {version:#010x}",
        num_blocks,
        num_roots
    );

    Ok(LoadReport { graph, warnings })
}

pub fn encode(graph: &BlockGraph) -> Result<Vec<u8>> {
    let plan = graph.plan_renumber(graph.roots())?;
    let mut ordered = graph.apply_renumber(&plan);

    // Intern each block's compound name into `ordered`'s own string table
    // (carried over from `graph` by `apply_renumber`, then grown here) so the
    // on-disk type table is read straight back out of the interner rather
    // than a parallel name list the interner never sees.
    let compound_names: Vec<String> = ordered.iter().map(|(_, inst)| inst.compound.clone()).collect();
    let block_type_ids: Vec<StringId> = compound_names
        .into_iter()
        .map(|name| ordered.intern_string(name.into_bytes()))
        .collect();

    let mut type_order: Vec<StringId> = Vec::new();
    let mut type_index_of: HashMap<StringId, u32> = HashMap::new();
    for &id in &block_type_ids {
        type_index_of.entry(id).or_insert_with(|| {
            let idx = type_order.len() as u32;
            type_order.push(id);
            idx
        });
    }

    let mut out = Vec::new();
    out.write_all(SIGNATURE)?;
    out.write_u32(ordered.version, Endian::Little)?;
    out.write_u32(ordered.user_version, Endian::Little)?;

    out.write_u32(type_order.len() as u32, Endian::Little)?;
    for &id in &type_order {
        let name = ordered
            .string(id)
            .expect("every interned type id resolves within its own graph");
        out.write_string(name, StringEncoding::Short, Endian::Little)?;
    }

    out.write_u32(ordered.len() as u32, Endian::Little)?;
    let ctx = WriteCtx {
        schema: &ordered.schema,
        version: ordered.version,
        user_version: ordered.user_version,
        endian: Endian::Little,
    };
    for (&block_type_id, (_, inst)) in block_type_ids.iter().zip(ordered.iter()) {
        let type_index = type_index_of[&block_type_id];
        out.write_u32(type_index, Endian::Little)?;
        engine::write_compound(&ctx, &mut out, &inst.compound, inst, None)?;
    }

    out.write_u32(ordered.roots().len() as u32, Endian::Little)?;
    for root in ordered.roots() {
        out.write_u32(root.0, Endian::Little)?;
    }

    Ok(out)
}

pub struct DemoGraphBinding;

impl FormatBinding for DemoGraphBinding {
    fn name(&self) -> &str {
        "demo-graph"
    }

    fn signature(&self) -> &[u8] {
        SIGNATURE
    }

    fn load(&self, bytes: &[u8]) -> Result<LoadReport> {
        decode(bytes)
    }

    fn save(&self, graph: &BlockGraph, out: &mut dyn Write) -> Result<()> {
        let bytes = encode(graph)?;
        out.write_all(&bytes)?;
        Ok(())
    }
}

pub fn binding() -> DemoGraphBinding {
    DemoGraphBinding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Instance, Link, LinkTarget, Value};

    fn node(label: &str, strong_child: LinkTarget, weak_back: LinkTarget) -> Instance {
        let mut inst = Instance::with_field_names(
            "Node".to_string(),
            vec![
                "kind".to_string(),
                "label".to_string(),
                "strong_child".to_string(),
                "weak_back".to_string(),
            ],
        );
        inst.set_field(
            1,
            Some(Value::Str(label.as_bytes().to_vec())),
        );
        inst.set_field(
            2,
            Some(Value::Link(Link {
                strong: true,
                target: strong_child,
            })),
        );
        inst.set_field(
            3,
            Some(Value::Link(Link {
                strong: false,
                target: weak_back,
            })),
        );
        inst
    }

    #[test]
    fn round_trips_a_cyclic_graph_via_weak_back_link() {
        let mut graph = BlockGraph::new(schema(), 1, 0, Endian::Little);
        let a = graph.push_block(node("a", LinkTarget::Unresolved(1), LinkTarget::Null));
        let _b = graph.push_block(node("b", LinkTarget::Null, LinkTarget::Unresolved(0)));
        graph.set_roots(vec![a]);
        graph.resolve_links().unwrap();

        let bytes = encode(&graph).unwrap();
        let report = decode(&bytes).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.graph.len(), 2);
    }

    #[test]
    fn rejects_unknown_signature() {
        assert!(decode(b"NOPE").is_err());
    }

    #[test]
    fn warns_about_trailing_bytes() {
        let mut graph = BlockGraph::new(schema(), 1, 0, Endian::Little);
        let a = graph.push_block(node("a", LinkTarget::Null, LinkTarget::Null));
        graph.set_roots(vec![a]);
        let mut bytes = encode(&graph).unwrap();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let report = decode(&bytes).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn link_type_mismatch_is_rejected() {
        // A Holder's "mesh" field is declared to target Mesh, but the file
        // points it at a Texture block instead.
        let mut graph = BlockGraph::new(schema(), 1, 0, Endian::Little);
        let texture = {
            let mut inst =
                Instance::with_field_names("Texture".to_string(), vec!["name".to_string()]);
            inst.set_field(0, Some(Value::Str(b"tex".to_vec())));
            graph.push_block(inst)
        };
        let holder = {
            let mut inst =
                Instance::with_field_names("Holder".to_string(), vec!["mesh".to_string()]);
            inst.set_field(
                0,
                Some(Value::Link(Link {
                    strong: true,
                    target: LinkTarget::Unresolved(texture.0 as i64),
                })),
            );
            graph.push_block(inst)
        };
        graph.set_roots(vec![holder]);
        assert!(graph.resolve_links().is_err());
    }

    #[test]
    fn binding_round_trips_through_format_registry() {
        let mut graph = BlockGraph::new(schema(), 1, 0, Endian::Little);
        let a = graph.push_block(node("root", LinkTarget::Null, LinkTarget::Null));
        graph.set_roots(vec![a]);

        let binding = binding();
        let mut out = Vec::new();
        binding.save(&graph, &mut out).unwrap();
        let report = binding.load(&out).unwrap();
        assert_eq!(report.graph.len(), 1);
    }
}

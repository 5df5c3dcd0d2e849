//! Integration tests for spec.md §8's six end-to-end scenarios, driven
//! entirely through the public API (`blockform::{schema, engine, graph,
//! registry, formats}`), not through any module-internal helper.

use std::io::Cursor;

use blockform::codec::Endian;
use blockform::engine::{self, ReadCtx, WriteCtx};
use blockform::formats::tga::{self, TgaImage};
use blockform::graph::traversal::Order;
use blockform::graph::BlockGraph;
use blockform::schema::loader::load_schema;
use blockform::value::{Instance, Link, LinkTarget, Value};
use blockform::FormatRegistry;

/// Scenario 1: minimal TGA write/read.
#[test]
fn minimal_tga_round_trips_byte_identical() {
    let image = TgaImage {
        width: 2,
        height: 2,
        pixels: vec![
            (255, 0, 0, 255),
            (0, 255, 0, 255),
            (0, 0, 255, 255),
            (255, 255, 255, 255),
        ],
    };
    let bytes = tga::encode(&image).unwrap();

    let registry = FormatRegistry::builtin();
    let mut cursor = Cursor::new(bytes.clone());
    let report = registry.open(&mut cursor).unwrap();
    assert!(report.warnings.is_empty());

    let mut out = Vec::new();
    registry.save("tga", &report.graph, &mut out).unwrap();
    assert_eq!(out, bytes);

    let (decoded, warnings) = tga::decode(&bytes).unwrap();
    assert!(warnings.is_empty());
    assert_eq!(decoded.pixels, image.pixels);
}

const VERSIONED_SCHEMA: &str = r#"
    <schema>
      <basic name="uint" bytes="4"/>
      <compound name="Header">
        <field name="legacy_flag" type="uint" ver2="0x04000000"/>
        <field name="tail" type="uint"/>
      </compound>
    </schema>
"#;

/// Scenario 2: versioned field presence, no bytes consumed when absent.
#[test]
fn versioned_field_presence_depends_only_on_header_version() {
    let schema = load_schema(VERSIONED_SCHEMA).unwrap();

    // version == 0x04000000: legacy_flag is present, both u32s on the wire.
    let mut present_bytes = Vec::new();
    {
        use blockform::codec::ByteWriter;
        present_bytes
            .write_u32(0xAAAA_AAAA, Endian::Little)
            .unwrap();
        present_bytes.write_u32(7, Endian::Little).unwrap();
    }
    let mut warnings = Vec::new();
    let mut ctx = ReadCtx {
        schema: &schema,
        version: 0x0400_0000,
        user_version: 0,
        endian: Endian::Little,
        warnings: &mut warnings,
    };
    let mut cur = Cursor::new(present_bytes);
    let instance = engine::read_compound(&mut ctx, &mut cur, "Header", None).unwrap();
    assert_eq!(instance.field("legacy_flag").unwrap().as_i64(), Some(0xAAAA_AAAAu32 as i64));
    assert_eq!(instance.field("tail").unwrap().as_i64(), Some(7));

    // version == 0x04000001: legacy_flag absent, only one u32 consumed.
    let mut absent_bytes = Vec::new();
    {
        use blockform::codec::ByteWriter;
        absent_bytes.write_u32(9, Endian::Little).unwrap();
    }
    let mut warnings = Vec::new();
    let mut ctx = ReadCtx {
        schema: &schema,
        version: 0x0400_0001,
        user_version: 0,
        endian: Endian::Little,
        warnings: &mut warnings,
    };
    let mut cur = Cursor::new(absent_bytes);
    let instance = engine::read_compound(&mut ctx, &mut cur, "Header", None).unwrap();
    assert!(instance.field("legacy_flag").is_none());
    assert_eq!(instance.field("tail").unwrap().as_i64(), Some(9));
}

const LINK_SCHEMA: &str = r#"
    <schema>
      <basic name="uint" bytes="4"/>
      <compound name="A">
        <field name="to_b" type="ref" target="B"/>
      </compound>
      <compound name="B">
        <field name="back" type="ref" target="A" weak="true"/>
      </compound>
      <compound name="Mesh">
        <field name="dummy" type="uint"/>
      </compound>
      <compound name="Texture">
        <field name="dummy" type="uint"/>
      </compound>
      <compound name="Holder">
        <field name="mesh" type="ref" target="Mesh"/>
      </compound>
    </schema>
"#;

fn scalar(name: &str, fields: &[(&str, Value)]) -> Instance {
    let names: Vec<String> = fields.iter().map(|(n, _)| n.to_string()).collect();
    let mut inst = Instance::with_field_names(name.to_string(), names);
    for (idx, (_, value)) in fields.iter().enumerate() {
        inst.set_field(idx, Some(value.clone()));
    }
    inst
}

/// Scenario 3: a strong link to B, a weak back-link from B to A. Walking
/// with `follow_weak=false` and `follow_weak=true` both yield `[A, B]`
/// (visit-once even when weak edges are followed), and writing reproduces
/// the same two-block shape.
#[test]
fn cycle_tolerance_via_weak_link() {
    let schema = load_schema(LINK_SCHEMA).unwrap();
    let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);

    let a = graph.push_block(scalar(
        "A",
        &[(
            "to_b",
            Value::Link(Link {
                strong: true,
                target: LinkTarget::Unresolved(1),
            }),
        )],
    ));
    let _b = graph.push_block(scalar(
        "B",
        &[(
            "back",
            Value::Link(Link {
                strong: false,
                target: LinkTarget::Unresolved(0),
            }),
        )],
    ));
    graph.set_roots(vec![a]);
    graph.resolve_links().unwrap();

    let mut strong_only = Vec::new();
    graph.walk(&[a], Order::Pre, false, |id, _| strong_only.push(id));
    assert_eq!(strong_only, vec![a, blockform::BlockId(1)]);

    let mut with_weak = Vec::new();
    graph.walk(&[a], Order::Pre, true, |id, _| with_weak.push(id));
    assert_eq!(with_weak, vec![a, blockform::BlockId(1)]);

    let plan = graph.plan_renumber(graph.roots()).unwrap();
    assert!(plan.dropped.is_empty());
    let renumbered = graph.apply_renumber(&plan);
    assert_eq!(renumbered.len(), 2);
}

/// Scenario 4: `insert_parent(child, new_parent)` rewrites root -> child
/// into root -> new_parent -> child, leaving child itself untouched.
#[test]
fn insert_parent_splices_a_new_node_above_the_child() {
    let schema = load_schema(LINK_SCHEMA).unwrap();
    let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);

    let child = graph.push_block(scalar("B", &[("back", Value::Link(Link::null(false)))]));
    let root = graph.push_block(scalar(
        "A",
        &[(
            "to_b",
            Value::Link(Link {
                strong: true,
                target: LinkTarget::Resolved(child),
            }),
        )],
    ));
    graph.set_roots(vec![root]);

    let new_parent = scalar("A", &[("to_b", Value::Link(Link::null(true)))]);
    let new_parent_id = graph
        .insert_parent(new_parent, "to_b", child, true)
        .unwrap();

    match graph.block(root).unwrap().field("to_b") {
        Some(Value::Link(link)) => {
            assert_eq!(link.target, LinkTarget::Resolved(new_parent_id));
        }
        other => panic!("unexpected {other:?}"),
    }
    match graph.block(new_parent_id).unwrap().field("to_b") {
        Some(Value::Link(link)) => assert_eq!(link.target, LinkTarget::Resolved(child)),
        other => panic!("unexpected {other:?}"),
    }
    // child is unchanged: it still has no outgoing link of its own.
    assert!(graph.block(child).unwrap().field("back").unwrap().as_link().unwrap().is_null());
}

const ENUM_SCHEMA: &str = r#"
    <schema>
      <basic name="uint" bytes="4"/>
      <enum name="Kind" storage="uint">
        <option name="A" value="0"/>
        <option name="B" value="1"/>
      </enum>
      <compound name="Tagged">
        <field name="kind" type="Kind"/>
      </compound>
    </schema>
"#;

/// Scenario 5: an out-of-range enum value loads with a warning and the
/// exact same raw byte comes back out on save.
#[test]
fn unknown_enum_value_is_preserved_and_warned_about() {
    let schema = load_schema(ENUM_SCHEMA).unwrap();
    let mut bytes = Vec::new();
    {
        use blockform::codec::ByteWriter;
        bytes.write_u32(7, Endian::Little).unwrap();
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
    let instance = engine::read_compound(&mut ctx, &mut cur, "Tagged", None).unwrap();
    assert_eq!(warnings.len(), 1);

    let mut out = Vec::new();
    let wctx = WriteCtx {
        schema: &schema,
        version: 0,
        user_version: 0,
        endian: Endian::Little,
    };
    engine::write_compound(&wctx, &mut out, "Tagged", &instance, None).unwrap();
    assert_eq!(out, bytes);
}

/// Scenario 6: a field declared as a strong link to `Mesh` whose file-level
/// index actually resolves to a `Texture` block fails link resolution and
/// yields no graph.
#[test]
fn link_type_mismatch_fails_load() {
    let schema = load_schema(LINK_SCHEMA).unwrap();
    let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);
    let texture = graph.push_block(scalar("Texture", &[("dummy", Value::UInt(0))]));
    let holder = graph.push_block(scalar(
        "Holder",
        &[(
            "mesh",
            Value::Link(Link {
                strong: true,
                target: LinkTarget::Unresolved(texture.0 as i64),
            }),
        )],
    ));
    graph.set_roots(vec![holder]);

    let err = graph.resolve_links().unwrap_err();
    assert!(matches!(err, blockform::Error::LinkTypeMismatch { .. }));
}

//! Minimal uncompressed truecolor TGA binding.
//!
//! Exercises C1/C2/C4 (a compound with an embedded array of a nested
//! compound) and C6 end to end, without any of C7's block-table machinery:
//! a TGA image is a single implicit block, has no links, and carries no
//! version at all. This is spec.md §8 scenario 1's "minimal TGA" format.

use std::io::{Cursor, Write};
use std::sync::OnceLock;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::Endian;
use crate::engine::{self, ReadCtx, Warning, WriteCtx};
use crate::error::{Error, Result};
use crate::graph::BlockGraph;
use crate::registry::{FormatBinding, LoadReport};
use crate::schema::loader::load_schema;
use crate::schema::model::Schema;
use crate::value::{ArrayValue, BlockId, Instance, Value};

/// The TGA `image_type` byte. Only the uncompressed-truecolor path this
/// binding targets is named; the rest of the TGA spec's image types
/// (colormapped, RLE-compressed) are out of scope but the schema still
/// needs somewhere to stash a value this crate didn't expect — see
/// [`Self::try_from`] call sites, which preserve rather than reject them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageType {
    NoImageData = 0,
    UncompressedTrueColor = 2,
}

/// `id_length=0, color_map_type=0, image_type=2` (uncompressed truecolor) —
/// the first three bytes of every image this binding writes.
pub const SIGNATURE: &[u8] = &[0, 0, 2];

const SCHEMA_XML: &str = r#"
    <schema>
      <basic name="byte" bytes="1"/>
      <basic name="ushort" bytes="2"/>
      <compound name="Pixel">
        <field name="b" type="byte"/>
        <field name="g" type="byte"/>
        <field name="r" type="byte"/>
        <field name="a" type="byte"/>
      </compound>
      <compound name="TgaImage">
        <field name="id_length" type="byte"/>
        <field name="color_map_type" type="byte"/>
        <field name="image_type" type="byte"/>
        <field name="color_map_origin" type="ushort"/>
        <field name="color_map_length" type="ushort"/>
        <field name="color_map_depth" type="byte"/>
        <field name="x_origin" type="ushort"/>
        <field name="y_origin" type="ushort"/>
        <field name="width" type="ushort"/>
        <field name="height" type="ushort"/>
        <field name="pixel_depth" type="byte"/>
        <field name="image_descriptor" type="byte"/>
        <field name="pixels" type="Pixel" arr1="width * height"/>
      </compound>
    </schema>
"#;

pub fn schema() -> Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA
        .get_or_init(|| load_schema(SCHEMA_XML).expect("tga schema is well-formed"))
        .clone()
}

/// An in-memory decoded truecolor TGA image, pixels in RGBA order
/// regardless of the BGRA order the wire format stores them in.
pub struct TgaImage {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<(u8, u8, u8, u8)>,
}

fn pixel_instance(r: u8, g: u8, b: u8, a: u8) -> Instance {
    let mut inst = Instance::with_field_names(
        "Pixel".to_string(),
        vec!["b".into(), "g".into(), "r".into(), "a".into()],
    );
    inst.set_field(0, Some(Value::UInt(b as u64)));
    inst.set_field(1, Some(Value::UInt(g as u64)));
    inst.set_field(2, Some(Value::UInt(r as u64)));
    inst.set_field(3, Some(Value::UInt(a as u64)));
    inst
}

fn image_instance(image: &TgaImage) -> Result<Instance> {
    if image.pixels.len() != image.width as usize * image.height as usize {
        return Err(Error::CorruptBlock(
            "pixel count does not match width * height".to_string(),
        ));
    }
    let field_names = [
        "id_length",
        "color_map_type",
        "image_type",
        "color_map_origin",
        "color_map_length",
        "color_map_depth",
        "x_origin",
        "y_origin",
        "width",
        "height",
        "pixel_depth",
        "image_descriptor",
        "pixels",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let mut inst = Instance::with_field_names("TgaImage".to_string(), field_names);
    inst.set_field(0, Some(Value::UInt(0)));
    inst.set_field(1, Some(Value::UInt(0)));
    inst.set_field(2, Some(Value::UInt(u8::from(ImageType::UncompressedTrueColor) as u64)));
    inst.set_field(3, Some(Value::UInt(0)));
    inst.set_field(4, Some(Value::UInt(0)));
    inst.set_field(5, Some(Value::UInt(0)));
    inst.set_field(6, Some(Value::UInt(0)));
    inst.set_field(7, Some(Value::UInt(0)));
    inst.set_field(8, Some(Value::UInt(image.width as u64)));
    inst.set_field(9, Some(Value::UInt(image.height as u64)));
    inst.set_field(10, Some(Value::UInt(32)));
    inst.set_field(11, Some(Value::UInt(0)));
    let pixels = image
        .pixels
        .iter()
        .map(|&(r, g, b, a)| Value::Instance(Box::new(pixel_instance(r, g, b, a))))
        .collect();
    inst.set_field(12, Some(Value::Array(ArrayValue::flat(pixels))));
    Ok(inst)
}

fn image_from_instance(inst: &Instance) -> Result<TgaImage> {
    let image_type = inst
        .field("image_type")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::CorruptBlock("TgaImage missing image_type".to_string()))?;
    match ImageType::try_from(image_type as u8) {
        Ok(ImageType::UncompressedTrueColor) => {}
        _ => {
            return Err(Error::CorruptBlock(format!(
                "unsupported TGA image_type {image_type}, this binding only reads uncompressed truecolor"
            )))
        }
    }
    let width = inst
        .field("width")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::CorruptBlock("TgaImage missing width".to_string()))? as u16;
    let height = inst
        .field("height")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::CorruptBlock("TgaImage missing height".to_string()))? as u16;
    let pixel_array = inst
        .field("pixels")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::CorruptBlock("TgaImage missing pixels".to_string()))?;
    let pixels = pixel_array
        .items
        .iter()
        .map(|v| {
            let p = v
                .as_instance()
                .ok_or_else(|| Error::CorruptBlock("pixel entry is not a compound".to_string()))?;
            let comp = |name: &str| -> Result<u8> {
                p.field(name)
                    .and_then(Value::as_i64)
                    .map(|v| v as u8)
                    .ok_or_else(|| Error::CorruptBlock(format!("Pixel missing {name:?}")))
            };
            Ok((comp("r")?, comp("g")?, comp("b")?, comp("a")?))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TgaImage {
        width,
        height,
        pixels,
    })
}

pub fn encode(image: &TgaImage) -> Result<Vec<u8>> {
    let schema = schema();
    let instance = image_instance(image)?;
    let ctx = WriteCtx {
        schema: &schema,
        version: 0,
        user_version: 0,
        endian: Endian::Little,
    };
    let mut out = Vec::new();
    engine::write_compound(&ctx, &mut out, "TgaImage", &instance, None)?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<(TgaImage, Vec<Warning>)> {
    let (instance, warnings) = decode_instance(bytes)?;
    Ok((image_from_instance(&instance)?, warnings))
}

fn decode_instance(bytes: &[u8]) -> Result<(Instance, Vec<Warning>)> {
    let schema = schema();
    let mut warnings = Vec::new();
    let mut cur = Cursor::new(bytes);
    let mut ctx = ReadCtx {
        schema: &schema,
        version: 0,
        user_version: 0,
        endian: Endian::Little,
        warnings: &mut warnings,
    };
    let instance = engine::read_compound(&mut ctx, &mut cur, "TgaImage", None)?;
    Ok((instance, warnings))
}

pub struct TgaBinding;

impl FormatBinding for TgaBinding {
    fn name(&self) -> &str {
        "tga"
    }

    fn signature(&self) -> &[u8] {
        SIGNATURE
    }

    fn load(&self, bytes: &[u8]) -> Result<LoadReport> {
        let (instance, warnings) = decode_instance(bytes)?;
        let mut graph = BlockGraph::new(schema(), 0, 0, Endian::Little);
        let root = graph.push_block(instance);
        graph.set_roots(vec![root]);
        Ok(LoadReport { graph, warnings })
    }

    fn save(&self, graph: &BlockGraph, out: &mut dyn Write) -> Result<()> {
        let root = graph
            .roots()
            .first()
            .copied()
            .unwrap_or(BlockId(0));
        let instance = graph
            .block(root)
            .ok_or_else(|| Error::CorruptBlock("graph has no TgaImage block".to_string()))?;
        let ctx = WriteCtx {
            schema: &graph.schema,
            version: graph.version,
            user_version: graph.user_version,
            endian: graph.endian,
        };
        let mut bytes = Vec::new();
        engine::write_compound(&ctx, &mut bytes, "TgaImage", instance, None)?;
        out.write_all(&bytes)?;
        Ok(())
    }
}

pub fn binding() -> TgaBinding {
    TgaBinding
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TgaImage {
        TgaImage {
            width: 2,
            height: 2,
            pixels: vec![
                (255, 0, 0, 255),
                (0, 255, 0, 255),
                (0, 0, 255, 255),
                (255, 255, 255, 255),
            ],
        }
    }

    #[test]
    fn header_has_expected_signature() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(&bytes[0..3], SIGNATURE);
    }

    #[test]
    fn roundtrips_pixels_exactly() {
        let image = sample();
        let bytes = encode(&image).unwrap();
        let (decoded, warnings) = decode(&bytes).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.pixels, image.pixels);
    }

    #[test]
    fn mismatched_pixel_count_is_rejected() {
        let image = TgaImage {
            width: 2,
            height: 2,
            pixels: vec![(0, 0, 0, 0)],
        };
        assert!(encode(&image).is_err());
    }

    #[test]
    fn binding_round_trips_through_format_registry() {
        let bytes = encode(&sample()).unwrap();
        let binding = binding();
        let report = binding.load(&bytes).unwrap();
        let mut out = Vec::new();
        binding.save(&report.graph, &mut out).unwrap();
        assert_eq!(out, bytes);
    }
}

//! `blockform`: a schema-driven binary (de)serialization kernel for
//! block-structured graph formats (scene graphs, keyframe/motion data,
//! mesh/geometry containers, simple image containers).
//!
//! The crate has no opinion about any particular wire format. A host
//! application supplies a [`schema::model::Schema`] (loaded from XML via
//! [`schema::loader::load_schema`]) describing compounds, enums, bitfields
//! and their version/condition gating, registers a [`registry::FormatBinding`]
//! that frames the format's header/block-table/string-table layout, and gets
//! back a navigable, mutable [`graph::BlockGraph`].
//!
//! Module map (mirrors the component breakdown this kernel was designed
//! against):
//!
//! - [`codec`] — C1, primitive integer/float/string codec.
//! - [`schema::model`] — C2, the resolved in-memory type system.
//! - [`schema::loader`] — C3, the XML schema parser.
//! - [`value`] — C4, the dynamic typed value tree.
//! - [`schema::expr`] — C5, the condition/length expression evaluator.
//! - [`engine`] — C6, the field-by-field serializer/deserializer.
//! - [`graph`] — C7, block-table framing and link resolution.
//! - [`graph::traversal`] — C8, typed walks and structural mutation.
//! - [`registry`] — C9, the file-format identity-to-schema binding table.
#![forbid(unsafe_code)]

pub mod codec;
pub mod engine;
pub mod error;
pub mod formats;
pub mod graph;
pub mod registry;
pub mod schema;
pub mod value;

pub use error::{Error, Result};
pub use graph::BlockGraph;
pub use registry::{FormatRegistry, LoadReport};
pub use schema::model::Schema;
pub use value::{BlockId, Instance, StringId, Value};

//! Declarative type system: [`model`] holds the resolved schema, [`expr`]
//! evaluates condition/length expressions, [`loader`] parses the XML source
//! form into a [`model::Schema`].

pub mod expr;
pub mod loader;
pub mod model;

pub use expr::{Expr, Scope};
pub use model::{
    BasicKind, BasicType, BitfieldDef, BitfieldSubfield, Compound, EnumDef, Field, FieldType,
    Schema, TemplateBinding, VersionFormat,
};

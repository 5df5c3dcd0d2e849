//! Concrete file-format bindings (C9 consumers). Each submodule owns its own
//! embedded schema source and framing logic and exposes a `binding()`
//! constructor for [`crate::registry::FormatRegistry`].
//!
//! Real NIF/KFM/CGF-style schemas are meant to be supplied by a host
//! application via [`crate::schema::loader::load_schema`] or
//! [`crate::schema::model::Schema`]; the two formats here are small enough to
//! define entirely in-crate and exist to exercise every component end to
//! end.

pub mod demo_graph;
pub mod tga;

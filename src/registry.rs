//! Format registry (C9): binds a file-format identity (signature prefix,
//! header compound, framing strategy, default endianness) to the schema
//! that describes it, and dispatches [`FormatRegistry::open`] to whichever
//! registered [`FormatBinding`] claims a stream's signature.

use std::io::{Read, Write};

use crate::engine::Warning;
use crate::error::{Error, Result};
use crate::graph::BlockGraph;

/// A successful load, plus whatever non-fatal problems C6/C7 noticed along
/// the way. Per spec.md §7, warnings never gate success; a load either
/// fully succeeds (with zero or more warnings) or fails and yields nothing.
pub struct LoadReport {
    pub graph: BlockGraph,
    pub warnings: Vec<Warning>,
}

/// A concrete file-format binding: knows its own signature, and how to turn
/// raw bytes into a [`BlockGraph`] and back. Implemented once per format
/// this crate ships (see `src/formats`); a host application can implement
/// it too and hand the binding to [`FormatRegistry::register`].
pub trait FormatBinding: Send + Sync {
    /// Stable name used for idempotent re-registration, not shown on the
    /// wire.
    fn name(&self) -> &str;

    /// Fixed byte pattern every file of this format starts with. The
    /// registry probes registrations in order, so a more specific prefix
    /// must be registered before a shorter one it contains.
    fn signature(&self) -> &[u8];

    fn load(&self, bytes: &[u8]) -> Result<LoadReport>;

    fn save(&self, graph: &BlockGraph, out: &mut dyn Write) -> Result<()>;
}

/// A table from format identity to binding. Registration order matters for
/// signature probing (see [`FormatBinding::signature`]); a `Vec` preserves
/// it where a `HashMap` would not. The registry is immutable once handed to
/// callers that share it across threads — `register` takes `&mut self`
/// precisely so that sharing only ever happens after setup is finished, per
/// spec.md §5's "read-only after initialization" resource model.
#[derive(Default)]
pub struct FormatRegistry {
    bindings: Vec<Box<dyn FormatBinding>>,
}

impl FormatRegistry {
    /// An empty registry a host populates itself with `register`, per
    /// Design Notes' test-isolation-friendly resolution of the "format
    /// registry as process-wide state" question.
    pub fn new() -> FormatRegistry {
        FormatRegistry::default()
    }

    /// A registry pre-populated with every format this crate ships a
    /// concrete [`FormatBinding`] for.
    pub fn builtin() -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        registry.register(Box::new(crate::formats::tga::binding()));
        registry.register(Box::new(crate::formats::demo_graph::binding()));
        registry
    }

    /// Register (or replace) a binding. Idempotent: registering the same
    /// `name` again overwrites the previous entry in place rather than
    /// appending a second, shadowed copy.
    pub fn register(&mut self, binding: Box<dyn FormatBinding>) {
        if let Some(slot) = self.bindings.iter_mut().find(|b| b.name() == binding.name()) {
            *slot = binding;
        } else {
            self.bindings.push(binding);
        }
    }

    fn find_binding(&self, bytes: &[u8]) -> Option<&dyn FormatBinding> {
        self.bindings
            .iter()
            .find(|b| bytes.starts_with(b.signature()))
            .map(|b| b.as_ref())
    }

    /// Probe `reader`'s signature against every registered binding, in
    /// registration order, and dispatch to the first match.
    pub fn open(&self, reader: &mut impl Read) -> Result<LoadReport> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let binding = self
            .find_binding(&bytes)
            .ok_or_else(|| Error::UnsupportedVersion {
                version: 0,
                user_version: 0,
            })?;
        binding.load(&bytes)
    }

    /// Write `graph` back out using the binding named `format`. Unlike
    /// `open`, the caller must name the format explicitly — a graph in
    /// memory carries no signature bytes to probe.
    pub fn save(&self, format: &str, graph: &BlockGraph, out: &mut impl Write) -> Result<()> {
        let binding = self
            .bindings
            .iter()
            .find(|b| b.name() == format)
            .ok_or_else(|| Error::UnknownType(format.to_string()))?;
        binding.save(graph, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_tga_before_demo_graph() {
        let registry = FormatRegistry::builtin();
        assert_eq!(registry.bindings[0].name(), "tga");
        assert_eq!(registry.bindings[1].name(), "demo-graph");
    }

    #[test]
    fn register_is_idempotent_by_name() {
        let mut registry = FormatRegistry::new();
        registry.register(Box::new(crate::formats::tga::binding()));
        registry.register(Box::new(crate::formats::tga::binding()));
        assert_eq!(registry.bindings.len(), 1);
    }

    #[test]
    fn open_with_unknown_signature_fails() {
        let registry = FormatRegistry::builtin();
        let mut cur = std::io::Cursor::new(vec![0u8; 16]);
        assert!(registry.open(&mut cur).is_err());
    }
}

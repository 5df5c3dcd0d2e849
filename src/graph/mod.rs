//! Block graph loader (C7): the table of decoded block instances, the
//! shared string table, and the two-pass link resolution / write-time
//! renumbering that turn raw on-disk indices into a navigable graph and
//! back.

pub mod traversal;

use std::collections::HashMap;

use crate::engine::Warning;
use crate::error::{Error, Result};
use crate::schema::model::{FieldType, Schema};
use crate::value::{ArrayValue, BlockId, Instance, Link, LinkTarget, StringId, Value};

/// A loaded set of blocks plus the schema and version context they were
/// read under. Link fields inside each block's [`Instance`] start out
/// holding raw on-disk indices ([`LinkTarget::Unresolved`]) and are fixed up
/// in place by [`BlockGraph::resolve_links`].
pub struct BlockGraph {
    pub schema: Schema,
    pub version: u32,
    pub user_version: u32,
    pub endian: crate::codec::Endian,
    strings: Vec<Vec<u8>>,
    string_index: HashMap<Vec<u8>, StringId>,
    blocks: Vec<Instance>,
    roots: Vec<BlockId>,
}

impl BlockGraph {
    pub fn new(
        schema: Schema,
        version: u32,
        user_version: u32,
        endian: crate::codec::Endian,
    ) -> BlockGraph {
        BlockGraph {
            schema,
            version,
            user_version,
            endian,
            strings: Vec::new(),
            string_index: HashMap::new(),
            blocks: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Entry points a format's header designates (e.g. a scene's root
    /// node). Traversal and write-time renumbering default to these unless
    /// the caller passes an explicit root set.
    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    pub fn set_roots(&mut self, roots: Vec<BlockId>) {
        self.roots = roots;
    }

    pub fn push_block(&mut self, instance: Instance) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(instance);
        id
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> Option<&Instance> {
        self.blocks.get(id.0 as usize)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Instance> {
        self.blocks.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Instance)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, inst)| (BlockId(i as u32), inst))
    }

    pub fn intern_string(&mut self, bytes: Vec<u8>) -> StringId {
        if let Some(id) = self.string_index.get(&bytes) {
            return *id;
        }
        let id = StringId(self.strings.len() as u32);
        self.string_index.insert(bytes.clone(), id);
        self.strings.push(bytes);
        id
    }

    pub fn string(&self, id: StringId) -> Option<&[u8]> {
        self.strings.get(id.0 as usize).map(|v| v.as_slice())
    }

    /// Stringify a `StringId` on demand, lossily if the interned bytes
    /// aren't valid UTF-8. Named to match this crate's other `resolve_*`
    /// two-pass-linking vocabulary even though string pools need no second
    /// pass of their own.
    pub fn resolve_string(&self, id: StringId) -> Option<std::borrow::Cow<'_, str>> {
        self.string(id).map(String::from_utf8_lossy)
    }

    pub fn strings(&self) -> &[Vec<u8>] {
        &self.strings
    }

    /// Convert every link field's raw on-disk index into a [`BlockId`],
    /// checking declared target types where the schema pins one down.
    /// Per spec.md §4.6, a negative index is already `Null` by the time the
    /// engine hands it over; this pass only has to fix up the non-negative
    /// ones, now that the full block count is known.
    pub fn resolve_links(&mut self) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        let len = self.blocks.len() as u32;
        for block in &mut self.blocks {
            resolve_links_in_instance(block, len, &self.schema)?;
        }
        // Type-check resolved links against their declared target compound,
        // now that every index is a real BlockId.
        for i in 0..self.blocks.len() {
            let msgs = self.check_link_types(BlockId(i as u32))?;
            warnings.extend(msgs);
        }
        Ok(warnings)
    }

    fn check_link_types(&self, id: BlockId) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        let instance = &self.blocks[id.0 as usize];
        self.check_link_types_in(instance, &mut warnings)?;
        Ok(warnings)
    }

    fn check_link_types_in(&self, instance: &Instance, warnings: &mut Vec<Warning>) -> Result<()> {
        let compound = self
            .schema
            .compound(&instance.compound)
            .ok_or_else(|| Error::UnknownType(instance.compound.clone()))?;
        for (idx, field) in compound.fields.iter().enumerate() {
            let Some(value) = instance.fields.get(idx).and_then(|v| v.as_ref()) else {
                continue;
            };
            let FieldType::Reference { target, .. } = &field.ty else {
                self.check_nested(value, warnings)?;
                continue;
            };
            let Some(declared) = target else { continue };
            self.check_link_value(value, declared, warnings)?;
        }
        Ok(())
    }

    fn check_nested(&self, value: &Value, warnings: &mut Vec<Warning>) -> Result<()> {
        match value {
            Value::Instance(inner) => self.check_link_types_in(inner, warnings),
            Value::Array(arr) => {
                for item in &arr.items {
                    self.check_nested(item, warnings)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_link_value(&self, value: &Value, declared: &str, warnings: &mut Vec<Warning>) -> Result<()> {
        match value {
            Value::Link(link) => {
                if let LinkTarget::Resolved(id) = link.target {
                    let actual = &self
                        .blocks
                        .get(id.0 as usize)
                        .ok_or_else(|| Error::LinkOutOfRange {
                            index: id.0 as i64,
                            len: self.blocks.len() as u32,
                        })?
                        .compound;
                    if !self.is_subtype(actual, declared) {
                        return Err(Error::LinkTypeMismatch {
                            declared: declared.to_string(),
                            actual: actual.clone(),
                            target_index: id.0,
                        });
                    }
                }
                Ok(())
            }
            Value::Array(arr) => {
                for item in &arr.items {
                    self.check_link_value(item, declared, warnings)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Is `actual` the same compound as `declared`, or one of its
    /// descendants through `parent`?
    fn is_subtype(&self, actual: &str, declared: &str) -> bool {
        let mut cur = actual.to_string();
        loop {
            if cur == declared {
                return true;
            }
            match self.schema.compound(&cur).and_then(|c| c.parent.clone()) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    /// `block.type_name` from spec.md §6: the compound a block was
    /// deserialized against.
    pub fn type_name(&self, id: BlockId) -> Option<&str> {
        self.block(id).map(|inst| inst.compound.as_str())
    }

    /// `block.get(field_name)` from spec.md §6.
    pub fn get(&self, id: BlockId, field: &str) -> Option<&Value> {
        self.block(id)?.field(field)
    }

    /// `block.set(field_name, value)` from spec.md §6: validates `value`
    /// against the field's declared schema type before writing it, so a
    /// caller can never smuggle a mistyped value into an instance that
    /// `write_compound` would later choke on mid-stream.
    pub fn set(&mut self, id: BlockId, field: &str, value: Value) -> Result<()> {
        let compound_name = self
            .block(id)
            .ok_or_else(|| Error::CorruptBlock(format!("no block {id}")))?
            .compound
            .clone();
        let compound = self
            .schema
            .compound(&compound_name)
            .ok_or_else(|| Error::UnknownType(compound_name))?;
        let idx = compound
            .field_index(field)
            .ok_or_else(|| Error::CorruptBlock(format!("no such field {field:?}")))?;
        let declared = &compound.fields[idx];
        check_value_type(declared, &value)?;
        self.block_mut(id).unwrap().set_field(idx, Some(value));
        Ok(())
    }
}

/// Structural check behind [`BlockGraph::set`]: does `value`'s shape match
/// what `field`'s declared type can hold? This does not recurse into
/// nested-compound field values field-by-field (a full sub-instance is
/// either the right compound or it isn't); it exists to catch the common
/// mistake of assigning the wrong *kind* of value, matching spec.md §6's
/// "fails with TypeError otherwise".
fn check_value_type(field: &crate::schema::model::Field, value: &Value) -> Result<()> {
    let declared_name = |ty: &FieldType| -> String {
        match ty {
            FieldType::Basic(n) | FieldType::Enum(n) | FieldType::Bitfield(n) | FieldType::Compound(n) => {
                n.clone()
            }
            FieldType::TemplateParam(n) => n.clone(),
            FieldType::Reference { .. } => "reference".to_string(),
            FieldType::StringField(_) => "string".to_string(),
        }
    };
    let type_error = || Error::TypeError {
        field: field.name.clone(),
        declared: declared_name(&field.ty),
        value_kind: value.kind_name().to_string(),
    };

    if field.is_array() {
        return match value {
            Value::Array(_) => Ok(()),
            _ => Err(type_error()),
        };
    }

    let ok = match (&field.ty, value) {
        (FieldType::Basic(_), Value::Int(_) | Value::UInt(_) | Value::Float(_)) => true,
        (FieldType::Enum(_), Value::EnumValue { .. }) => true,
        (FieldType::Bitfield(_), Value::BitfieldValue { .. }) => true,
        (FieldType::Compound(name), Value::Instance(inst)) => &inst.compound == name,
        (FieldType::TemplateParam(_), _) => true,
        (FieldType::Reference { .. }, Value::Link(_)) => true,
        (FieldType::StringField(_), Value::Str(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(type_error())
    }
}

fn resolve_links_in_instance(instance: &mut Instance, block_count: u32, schema: &Schema) -> Result<()> {
    let compound_name = instance.compound.clone();
    let compound = schema
        .compound(&compound_name)
        .ok_or_else(|| Error::UnknownType(compound_name))?
        .clone();
    for (idx, field) in compound.fields.iter().enumerate() {
        if let Some(value) = instance.fields.get_mut(idx).and_then(|v| v.as_mut()) {
            resolve_links_in_value(value, block_count, schema, matches!(field.ty, FieldType::Reference { .. }))?;
        }
    }
    Ok(())
}

fn resolve_links_in_value(
    value: &mut Value,
    block_count: u32,
    schema: &Schema,
    is_link_field: bool,
) -> Result<()> {
    match value {
        Value::Link(link) if is_link_field => {
            if let LinkTarget::Unresolved(idx) = link.target {
                if idx as u32 >= block_count {
                    return Err(Error::LinkOutOfRange {
                        index: idx,
                        len: block_count,
                    });
                }
                link.target = LinkTarget::Resolved(BlockId(idx as u32));
            }
            Ok(())
        }
        Value::Instance(inner) => resolve_links_in_instance(inner, block_count, schema),
        Value::Array(ArrayValue { items, .. }) => {
            for item in items {
                resolve_links_in_value(item, block_count, schema, is_link_field)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Visit every [`Link`] reachable from `instance` (including nested
/// compounds and arrays), regardless of strength.
pub(crate) fn for_each_link(instance: &Instance, f: &mut impl FnMut(&Link)) {
    for value in instance.fields.iter().flatten() {
        for_each_link_in_value(value, f);
    }
}

fn for_each_link_in_value(value: &Value, f: &mut impl FnMut(&Link)) {
    match value {
        Value::Link(link) => f(link),
        Value::Instance(inner) => for_each_link(inner, f),
        Value::Array(arr) => {
            for item in &arr.items {
                for_each_link_in_value(item, f);
            }
        }
        _ => {}
    }
}

pub(crate) fn for_each_link_mut(instance: &mut Instance, f: &mut impl FnMut(&mut Link)) {
    for value in instance.fields.iter_mut().flatten() {
        for_each_link_in_value_mut(value, f);
    }
}

fn for_each_link_in_value_mut(value: &mut Value, f: &mut impl FnMut(&mut Link)) {
    match value {
        Value::Link(link) => f(link),
        Value::Instance(inner) => for_each_link_mut(inner, f),
        Value::Array(arr) => {
            for item in &mut arr.items {
                for_each_link_in_value_mut(item, f);
            }
        }
        _ => {}
    }
}

/// Result of [`BlockGraph::plan_renumber`]: the stable DFS order new indices
/// were assigned in, and which old blocks were unreachable and dropped.
pub struct RenumberPlan {
    /// `old_to_new[i]` is the new id for old block `i`, or `None` if dropped.
    pub old_to_new: Vec<Option<BlockId>>,
    pub order: Vec<BlockId>,
    pub dropped: Vec<BlockId>,
}

impl BlockGraph {
    /// Compute a stable renumbering rooted at `roots`: a depth-first walk
    /// following only strong links establishes both the new ordering and
    /// the keep-set. Per spec.md §3/§8, weak links never contribute to
    /// keep-alive: a block reachable from a root solely through a weak
    /// link is unreachable for renumbering purposes and is dropped, with
    /// the dangling weak link nulled by [`BlockGraph::apply_renumber`]. A
    /// strong-link cycle is a schema/data violation, not a supported
    /// topology, and is reported as an error.
    pub fn plan_renumber(&self, roots: &[BlockId]) -> Result<RenumberPlan> {
        let mut visited = vec![false; self.blocks.len()];
        let mut on_stack = vec![false; self.blocks.len()];
        let mut order = Vec::new();

        for &root in roots {
            self.dfs_strong(root, &mut visited, &mut on_stack, &mut order)?;
        }

        let mut old_to_new = vec![None; self.blocks.len()];
        for (new_idx, &old_id) in order.iter().enumerate() {
            old_to_new[old_id.0 as usize] = Some(BlockId(new_idx as u32));
        }
        let dropped = (0..self.blocks.len())
            .filter(|&i| old_to_new[i].is_none())
            .map(|i| BlockId(i as u32))
            .collect();

        Ok(RenumberPlan {
            old_to_new,
            order,
            dropped,
        })
    }

    fn dfs_strong(
        &self,
        id: BlockId,
        visited: &mut [bool],
        on_stack: &mut [bool],
        order: &mut Vec<BlockId>,
    ) -> Result<()> {
        let idx = id.0 as usize;
        if idx >= visited.len() {
            return Err(Error::LinkOutOfRange {
                index: id.0 as i64,
                len: visited.len() as u32,
            });
        }
        if visited[idx] {
            return Ok(());
        }
        if on_stack[idx] {
            return Err(Error::CorruptBlock(format!(
                "strong-link cycle reaches block {id} again"
            )));
        }
        on_stack[idx] = true;
        visited[idx] = true;
        order.push(id);

        let mut strong_targets = Vec::new();
        if let Some(inst) = self.block(id) {
            for_each_link(inst, &mut |link| {
                if link.strong {
                    if let LinkTarget::Resolved(target) = link.target {
                        strong_targets.push(target);
                    }
                }
            });
        }
        for target in strong_targets {
            self.dfs_strong(target, visited, on_stack, order)?;
        }
        on_stack[idx] = false;
        Ok(())
    }

    /// Apply a renumber plan: build a new, compacted `BlockGraph` in DFS
    /// order, remapping every resolved link target and nulling any link
    /// that pointed at a dropped (unreachable) block.
    pub fn apply_renumber(&self, plan: &RenumberPlan) -> BlockGraph {
        if !plan.dropped.is_empty() {
            log::debug!(
                "dropping {} unreachable block(s) on write: {:?}",
                plan.dropped.len(),
                plan.dropped
            );
        }
        let mut new_graph = BlockGraph::new(self.schema.clone(), self.version, self.user_version, self.endian);
        new_graph.strings = self.strings.clone();
        new_graph.string_index = self.string_index.clone();

        for &old_id in &plan.order {
            let mut instance = self.blocks[old_id.0 as usize].clone();
            for_each_link_mut(&mut instance, &mut |link| {
                if let LinkTarget::Resolved(target) = link.target {
                    link.target = match plan.old_to_new.get(target.0 as usize).copied().flatten() {
                        Some(new_id) => LinkTarget::Resolved(new_id),
                        None => LinkTarget::Null,
                    };
                }
            });
            new_graph.push_block(instance);
        }
        new_graph.roots = self
            .roots
            .iter()
            .filter_map(|id| plan.old_to_new.get(id.0 as usize).copied().flatten())
            .collect();
        new_graph
    }
}

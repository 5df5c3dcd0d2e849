//! Graph traversal/mutation (C8): ordered walks over an already-resolved
//! [`BlockGraph`], plus the structural edits (`replace`, `insert_parent`,
//! `remove`) a caller uses to restructure it before writing.

use crate::error::{Error, Result};
use crate::schema::model::FieldType;
use crate::value::{BlockId, Instance, Link, LinkTarget};

use super::{for_each_link, for_each_link_mut, BlockGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Pre,
    Post,
}

impl BlockGraph {
    /// Depth-first walk from `roots`, visiting each block at most once.
    /// `follow_weak` controls whether weak links are followed as edges (the
    /// DAG structure strong links alone provide is usually what callers
    /// want; set this when a back-reference genuinely needs visiting too).
    pub fn walk(
        &self,
        roots: &[BlockId],
        order: Order,
        follow_weak: bool,
        mut visit: impl FnMut(BlockId, &Instance),
    ) {
        let mut visited = vec![false; self.len()];
        for &root in roots {
            self.walk_one(root, order, follow_weak, &mut visited, &mut visit);
        }
    }

    fn walk_one(
        &self,
        id: BlockId,
        order: Order,
        follow_weak: bool,
        visited: &mut [bool],
        visit: &mut impl FnMut(BlockId, &Instance),
    ) {
        let idx = id.0 as usize;
        if idx >= visited.len() || visited[idx] {
            return;
        }
        visited[idx] = true;
        let Some(instance) = self.block(id) else {
            return;
        };

        if order == Order::Pre {
            visit(id, instance);
        }

        let mut children = Vec::new();
        for_each_link(instance, &mut |link| {
            if link.strong || follow_weak {
                if let LinkTarget::Resolved(target) = link.target {
                    children.push(target);
                }
            }
        });
        for child in children {
            self.walk_one(child, order, follow_weak, visited, visit);
        }

        if order == Order::Post {
            // re-borrow: `instance` above is still valid, nothing mutated it.
            visit(id, instance);
        }
    }

    /// Collect every block reachable from `roots` for which `predicate`
    /// holds, in pre-order.
    pub fn find(
        &self,
        roots: &[BlockId],
        follow_weak: bool,
        predicate: impl Fn(BlockId, &Instance) -> bool,
    ) -> Vec<BlockId> {
        let mut out = Vec::new();
        self.walk(roots, Order::Pre, follow_weak, |id, inst| {
            if predicate(id, inst) {
                out.push(id);
            }
        });
        out
    }

    /// Redirect every link (anywhere in the graph) that currently resolves
    /// to `old` so it instead resolves to `new`.
    pub fn replace(&mut self, old: BlockId, new: BlockId) {
        for block in self.blocks_mut_inner() {
            for_each_link_mut(block, &mut |link| {
                if link.target == LinkTarget::Resolved(old) {
                    link.target = LinkTarget::Resolved(new);
                }
            });
        }
    }

    /// Insert `new_parent` as a new block, point its `link_field` at
    /// `child`, and redirect every existing *strong* link to `child`
    /// elsewhere in the graph to point at the new block instead. Weak
    /// (back-reference) links to `child` are left alone, since they
    /// typically exist precisely to reach `child` directly.
    pub fn insert_parent(
        &mut self,
        mut new_parent: Instance,
        link_field: &str,
        child: BlockId,
        strong: bool,
    ) -> Result<BlockId> {
        let compound = self
            .schema
            .compound(&new_parent.compound)
            .ok_or_else(|| Error::UnknownType(new_parent.compound.clone()))?
            .clone();
        let field_idx = compound
            .field_index(link_field)
            .ok_or_else(|| Error::CorruptBlock(format!("no such field {link_field:?}")))?;
        if !matches!(compound.fields[field_idx].ty, FieldType::Reference { .. }) {
            return Err(Error::CorruptBlock(format!(
                "field {link_field:?} is not a reference field"
            )));
        }
        new_parent.set_field(
            field_idx,
            Some(crate::value::Value::Link(Link {
                strong,
                target: LinkTarget::Resolved(child),
            })),
        );
        let new_id = self.push_block(new_parent);

        for i in 0..self.len() {
            let id = BlockId(i as u32);
            if id == new_id {
                continue;
            }
            if let Some(block) = self.block_mut(id) {
                for_each_link_mut(block, &mut |link| {
                    if link.strong && link.target == LinkTarget::Resolved(child) {
                        link.target = LinkTarget::Resolved(new_id);
                    }
                });
            }
        }
        Ok(new_id)
    }

    /// Sever every link pointing at `id`. With `cascade`, also remove any
    /// block `id` strongly referenced that has no other remaining strong
    /// referrer, recursively. Blocks are never physically removed from the
    /// table mid-session (that would invalidate other live `BlockId`s); the
    /// next write's renumbering pass drops whatever is left unreachable.
    pub fn remove(&mut self, id: BlockId, cascade: bool) -> Result<()> {
        let strong_children = if cascade {
            let mut children = Vec::new();
            if let Some(inst) = self.block(id) {
                for_each_link(inst, &mut |link| {
                    if link.strong {
                        if let LinkTarget::Resolved(target) = link.target {
                            children.push(target);
                        }
                    }
                });
            }
            children
        } else {
            Vec::new()
        };

        self.sever_incoming(id);
        self.roots_mut().retain(|&r| r != id);

        for child in strong_children {
            if !self.has_incoming_strong(child) {
                self.remove(child, true)?;
            }
        }
        Ok(())
    }

    fn sever_incoming(&mut self, id: BlockId) {
        for i in 0..self.len() {
            if let Some(block) = self.block_mut(BlockId(i as u32)) {
                for_each_link_mut(block, &mut |link| {
                    if link.target == LinkTarget::Resolved(id) {
                        link.target = LinkTarget::Null;
                    }
                });
            }
        }
    }

    fn has_incoming_strong(&self, id: BlockId) -> bool {
        for (_, inst) in self.iter() {
            let mut found = false;
            for_each_link(inst, &mut |link| {
                if link.strong && link.target == LinkTarget::Resolved(id) {
                    found = true;
                }
            });
            if found {
                return true;
            }
        }
        false
    }

    // `BlockGraph::blocks` is private to `graph`, and `traversal` is its
    // child module, so this direct field borrow is in scope.
    fn blocks_mut_inner(&mut self) -> Vec<&mut Instance> {
        self.blocks.iter_mut().collect()
    }

    fn roots_mut(&mut self) -> &mut Vec<BlockId> {
        &mut self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Endian;
    use crate::schema::loader::load_schema;
    use crate::value::Value;

    const SCHEMA: &str = r#"
        <schema>
          <basic name="uint" bytes="4"/>
          <compound name="Node">
            <field name="child" type="ref" target="Node"/>
          </compound>
        </schema>
    "#;

    fn node(child: LinkTarget) -> Instance {
        let mut inst = Instance::with_field_names("Node".to_string(), vec!["child".to_string()]);
        inst.set_field(
            0,
            Some(Value::Link(Link {
                strong: true,
                target: child,
            })),
        );
        inst
    }

    #[test]
    fn walk_visits_each_block_once() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);
        let a = graph.push_block(node(LinkTarget::Unresolved(1)));
        let _b = graph.push_block(node(LinkTarget::Null));
        graph.resolve_links().unwrap();

        let mut seen = Vec::new();
        graph.walk(&[a], Order::Pre, false, |id, _| seen.push(id));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn insert_parent_redirects_strong_referrers() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);
        let child = graph.push_block(node(LinkTarget::Null));
        let referrer = graph.push_block(node(LinkTarget::Resolved(child)));

        let new_parent = Instance::with_field_names("Node".to_string(), vec!["child".to_string()]);
        let new_id = graph
            .insert_parent(new_parent, "child", child, true)
            .unwrap();

        let referrer_inst = graph.block(referrer).unwrap();
        match referrer_inst.field("child") {
            Some(Value::Link(link)) => assert_eq!(link.target, LinkTarget::Resolved(new_id)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn remove_severs_incoming_links() {
        let schema = load_schema(SCHEMA).unwrap();
        let mut graph = BlockGraph::new(schema, 1, 0, Endian::Little);
        let child = graph.push_block(node(LinkTarget::Null));
        let referrer = graph.push_block(node(LinkTarget::Resolved(child)));
        graph.remove(child, false).unwrap();
        match graph.block(referrer).unwrap().field("child") {
            Some(Value::Link(link)) => assert!(link.is_null()),
            other => panic!("unexpected {other:?}"),
        }
    }
}

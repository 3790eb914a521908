//! Provenance graph maintenance.
//!
//! Edges are stored twice, as `parents` on the derived tag and `children` on
//! its source. Every function here is a pure transformation of a
//! [`Document`]; callers run them inside a locked mutation.

use tracing::warn;

use crate::domain::RelativeRef;
use crate::store::{Document, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Parents,
    Children,
}

impl Side {
    fn inverse(self) -> Self {
        match self {
            Side::Parents => Side::Children,
            Side::Children => Side::Parents,
        }
    }

    fn of(self, tag: &Tag) -> &Vec<String> {
        match self {
            Side::Parents => &tag.parents,
            Side::Children => &tag.children,
        }
    }

    fn of_mut(self, tag: &mut Tag) -> &mut Vec<String> {
        match self {
            Side::Parents => &mut tag.parents,
            Side::Children => &mut tag.children,
        }
    }
}

fn lookup<'a>(document: &'a Document, node: &RelativeRef) -> Option<&'a Tag> {
    document.tag(&node.collection, &node.asset, &node.tag)
}

fn lookup_mut<'a>(document: &'a mut Document, node: &RelativeRef) -> Option<&'a mut Tag> {
    document.tag_mut(&node.collection, &node.asset, &node.tag)
}

fn push_unique(list: &mut Vec<String>, value: String) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    true
}

fn all_nodes(document: &Document) -> Vec<RelativeRef> {
    let mut nodes = Vec::new();
    for (digest, collection) in &document.collections {
        for (asset, entry) in &collection.assets {
            for tag in entry.tags.keys() {
                nodes.push(RelativeRef::new(digest, asset, tag));
            }
        }
    }
    nodes
}

/// Record that `child` was derived from `parent` on both endpoints.
/// Missing endpoints are ignored; returns whether anything changed.
pub fn link(document: &mut Document, child: &RelativeRef, parent: &RelativeRef) -> bool {
    let mut changed = false;
    if let Some(tag) = lookup_mut(document, child) {
        changed |= push_unique(&mut tag.parents, parent.to_string());
    }
    if let Some(tag) = lookup_mut(document, parent) {
        changed |= push_unique(&mut tag.children, child.to_string());
    }
    changed
}

/// Remove every back-reference to `node` held by its neighbours, returning
/// the number of edges removed. The node's own lists are left untouched.
pub fn detach(document: &mut Document, node: &RelativeRef) -> usize {
    drop_back_references(document, node, &[Side::Parents, Side::Children])
}

/// Remove `node` from the `children` of every tag it lists as a parent.
/// Used before a tag is replaced with a new parent set.
pub fn detach_from_parents(document: &mut Document, node: &RelativeRef) -> usize {
    drop_back_references(document, node, &[Side::Parents])
}

fn drop_back_references(document: &mut Document, node: &RelativeRef, sides: &[Side]) -> usize {
    let Some(tag) = lookup(document, node) else {
        return 0;
    };
    let me = node.to_string();
    let neighbours: Vec<(Side, String)> = sides
        .iter()
        .flat_map(|&side| side.of(tag).iter().map(move |r| (side.inverse(), r.clone())))
        .collect();

    let mut removed = 0;
    for (side, reference) in neighbours {
        let Ok(neighbour) = reference.parse::<RelativeRef>() else {
            continue;
        };
        if let Some(other) = lookup_mut(document, &neighbour) {
            let list = side.of_mut(other);
            let before = list.len();
            list.retain(|r| r != &me);
            removed += before - list.len();
        }
    }
    removed
}

/// Rewrite references to `old` as `new` across the whole document.
pub fn rename_node(document: &mut Document, old: &RelativeRef, new: &RelativeRef) -> usize {
    let old_s = old.to_string();
    let new_s = new.to_string();
    let mut rewritten = 0;
    for collection in document.collections.values_mut() {
        for asset in collection.assets.values_mut() {
            for tag in asset.tags.values_mut() {
                for reference in tag.parents.iter_mut().chain(tag.children.iter_mut()) {
                    if *reference == old_s {
                        *reference = new_s.clone();
                        rewritten += 1;
                    }
                }
            }
        }
    }
    rewritten
}

/// Every edge `(from, to)` whose inverse is absent, either because the
/// target tag does not exist or does not list `from` back.
pub fn asymmetric_edges(document: &Document) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for node in all_nodes(document) {
        let Some(tag) = lookup(document, &node) else {
            continue;
        };
        let me = node.to_string();
        for side in [Side::Parents, Side::Children] {
            for reference in side.of(tag) {
                let symmetric = reference
                    .parse::<RelativeRef>()
                    .ok()
                    .and_then(|other| lookup(document, &other))
                    .is_some_and(|other| side.inverse().of(other).contains(&me));
                if !symmetric {
                    found.push((me.clone(), reference.clone()));
                }
            }
        }
    }
    found
}

/// Make every edge symmetric. Edges to tags that no longer exist are dropped;
/// edges whose target exists gain the missing inverse. Returns the repaired
/// `(from, to)` pairs.
pub fn repair(document: &mut Document) -> Vec<(String, String)> {
    let broken = asymmetric_edges(document);
    for (from, to) in &broken {
        let Ok(from_node) = from.parse::<RelativeRef>() else {
            continue;
        };
        let target = to
            .parse::<RelativeRef>()
            .ok()
            .filter(|node| lookup(document, node).is_some());
        let Some(from_tag) = lookup(document, &from_node) else {
            continue;
        };
        let side = if from_tag.parents.contains(to) {
            Side::Parents
        } else {
            Side::Children
        };
        match target {
            Some(target) => {
                if let Some(other) = lookup_mut(document, &target) {
                    push_unique(side.inverse().of_mut(other), from.clone());
                }
            }
            None => {
                if let Some(tag) = lookup_mut(document, &from_node) {
                    side.of_mut(tag).retain(|r| r != to);
                }
            }
        }
        warn!(%from, %to, "repaired asymmetric relationship");
    }
    broken
}

//! Shape-independent traversal of a document tree.
//!
//! One recursive walk over `DocumentValue`, dispatched by variant, feeds every
//! reachable node to a visitor together with its `DocPath`. Maps are visited in
//! key order, lists in index order. Depth is bounded by the JSON decoder's
//! recursion limit, so plain recursion is fine here.

use crate::document::{DocPath, DocumentValue, Map, PathSegment};

/// Read-only visitor.
pub trait Visitor {
    /// Called for every node before it is descended into or visited as a leaf.
    /// Returning `false` skips the node and everything below it.
    fn enter(&mut self, _path: &DocPath, _node: &DocumentValue) -> bool {
        true
    }

    /// Called for every scalar (anything that is not a map or a list).
    fn visit_leaf(&mut self, path: &DocPath, leaf: &DocumentValue);
}

/// Visitor that may rewrite leaves and maps in place.
pub trait VisitorMut {
    fn enter(&mut self, _path: &DocPath, _node: &DocumentValue) -> bool {
        true
    }

    fn visit_leaf(&mut self, path: &DocPath, leaf: &mut DocumentValue);

    /// Called after all children of a map have been walked.
    fn leave_map(&mut self, _path: &DocPath, _map: &mut Map) {}
}

pub fn walk<V: Visitor + ?Sized>(root: &DocumentValue, visitor: &mut V) {
    let mut path = DocPath::root();
    walk_node(root, &mut path, visitor);
}

pub fn walk_mut<V: VisitorMut + ?Sized>(root: &mut DocumentValue, visitor: &mut V) {
    let mut path = DocPath::root();
    walk_node_mut(root, &mut path, visitor);
}

fn walk_node<V: Visitor + ?Sized>(node: &DocumentValue, path: &mut DocPath, visitor: &mut V) {
    if !visitor.enter(path, node) {
        return;
    }
    match node {
        DocumentValue::Map(map) => {
            for (key, child) in map {
                path.push(PathSegment::Key(key.clone()));
                walk_node(child, path, visitor);
                path.pop();
            }
        }
        DocumentValue::List(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                walk_node(child, path, visitor);
                path.pop();
            }
        }
        leaf => visitor.visit_leaf(path, leaf),
    }
}

fn walk_node_mut<V: VisitorMut + ?Sized>(
    node: &mut DocumentValue,
    path: &mut DocPath,
    visitor: &mut V,
) {
    if !visitor.enter(path, node) {
        return;
    }
    match node {
        DocumentValue::Map(map) => {
            for (key, child) in map.iter_mut() {
                path.push(PathSegment::Key(key.clone()));
                walk_node_mut(child, path, visitor);
                path.pop();
            }
            visitor.leave_map(path, map);
        }
        DocumentValue::List(items) => {
            for (index, child) in items.iter_mut().enumerate() {
                path.push(PathSegment::Index(index));
                walk_node_mut(child, path, visitor);
                path.pop();
            }
        }
        leaf => visitor.visit_leaf(path, leaf),
    }
}

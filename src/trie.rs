//! Segment trie keyed by [`CacheKey`].
//!
//! Prefix lookups are a subtree walk instead of a scan over every key.

use std::collections::BTreeMap;

use crate::key::{CacheKey, Segment};

struct Node<T> {
  value: Option<T>,
  children: BTreeMap<Segment, Node<T>>,
}

impl<T> Default for Node<T> {
  fn default() -> Self {
    Self {
      value: None,
      children: BTreeMap::new(),
    }
  }
}

impl<T> Node<T> {
  fn is_vacant(&self) -> bool {
    self.value.is_none() && self.children.is_empty()
  }
}

pub struct KeyTrie<T> {
  root: Node<T>,
  len: usize,
}

impl<T> Default for KeyTrie<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> KeyTrie<T> {
  pub fn new() -> Self {
    Self {
      root: Node::default(),
      len: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  fn node(&self, segments: &[Segment]) -> Option<&Node<T>> {
    let mut node = &self.root;
    for segment in segments {
      node = node.children.get(segment)?;
    }
    Some(node)
  }

  pub fn get(&self, key: &CacheKey) -> Option<&T> {
    self.node(key.segments())?.value.as_ref()
  }

  pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut T> {
    let mut node = &mut self.root;
    for segment in key.segments() {
      node = node.children.get_mut(segment)?;
    }
    node.value.as_mut()
  }

  /// Get the value at `key`, inserting one built by `init` if absent.
  /// The flag reports whether the value was just created.
  pub fn get_or_insert_with(&mut self, key: &CacheKey, init: impl FnOnce() -> T) -> (&mut T, bool) {
    let mut node = &mut self.root;
    for segment in key.segments() {
      node = node.children.entry(segment.clone()).or_default();
    }
    let created = node.value.is_none();
    if created {
      self.len += 1;
    }
    (node.value.get_or_insert_with(init), created)
  }

  #[cfg(test)]
  pub fn insert(&mut self, key: &CacheKey, value: T) -> Option<T> {
    let mut node = &mut self.root;
    for segment in key.segments() {
      node = node.children.entry(segment.clone()).or_default();
    }
    let previous = node.value.replace(value);
    if previous.is_none() {
      self.len += 1;
    }
    previous
  }

  /// Remove the value at `key`, pruning branches left empty.
  pub fn remove(&mut self, key: &CacheKey) -> Option<T> {
    let removed = Self::remove_at(&mut self.root, key.segments());
    if removed.is_some() {
      self.len -= 1;
    }
    removed
  }

  fn remove_at(node: &mut Node<T>, segments: &[Segment]) -> Option<T> {
    match segments.split_first() {
      None => node.value.take(),
      Some((head, rest)) => {
        let child = node.children.get_mut(head)?;
        let removed = Self::remove_at(child, rest);
        if child.is_vacant() {
          node.children.remove(head);
        }
        removed
      }
    }
  }

  /// Every stored key equal to or extending `prefix`, in key order.
  pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    let mut out = Vec::new();
    if let Some(node) = self.node(prefix.segments()) {
      let mut path = prefix.segments().to_vec();
      Self::collect(node, &mut path, &mut out);
    }
    out
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.keys_with_prefix(&CacheKey::default())
  }

  fn collect(node: &Node<T>, path: &mut Vec<Segment>, out: &mut Vec<CacheKey>) {
    if node.value.is_some() {
      out.push(CacheKey::from(path.clone()));
    }
    for (segment, child) in &node.children {
      path.push(segment.clone());
      Self::collect(child, path, out);
      path.pop();
    }
  }

  /// Remove everything, returning the values that were stored.
  pub fn drain(&mut self) -> Vec<T> {
    let mut values = Vec::with_capacity(self.len);
    let mut stack = vec![std::mem::take(&mut self.root)];
    while let Some(mut node) = stack.pop() {
      if let Some(value) = node.value.take() {
        values.push(value);
      }
      stack.extend(std::mem::take(&mut node.children).into_values());
    }
    self.len = 0;
    values
  }
}

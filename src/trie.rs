//! In-memory Merkle-Patricia trie used for transaction roots and for
//! content-addressed pending-block bodies.
//!
//! Nodes encode as RLP (two-item leaf/extension lists with hex-prefixed
//! nibble paths, 17-item branches) and are addressed by the keccak-256 of
//! their encoding. Child references are always hashes, so a trie can be
//! persisted as a flat node map and rebuilt from any node source.

use std::collections::HashMap;

use rlp::{Rlp, RlpStream};

use crate::codec::keccak;
use crate::errors::{ChainError, ChainResult};
use crate::types::Hash;

/// Root of a trie with no entries.
pub fn empty_trie_root() -> Hash {
    keccak(&rlp::NULL_RLP)
}

enum Node {
    Leaf { path: Vec<u8>, value: Vec<u8> },
    Extension { path: Vec<u8>, child: Hash },
    Branch { children: Box<[Option<Hash>; 16]>, value: Option<Vec<u8>> },
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        match self {
            Node::Leaf { path, value } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&hex_prefix(path, true));
                stream.append(value);
                stream.out().to_vec()
            }
            Node::Extension { path, child } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&hex_prefix(path, false));
                stream.append(&child.to_vec());
                stream.out().to_vec()
            }
            Node::Branch { children, value } => {
                let mut stream = RlpStream::new_list(17);
                for child in children.iter() {
                    match child {
                        Some(hash) => stream.append(&hash.to_vec()),
                        None => stream.append(&Vec::<u8>::new()),
                    };
                }
                match value {
                    Some(value) => stream.append(value),
                    None => stream.append(&Vec::<u8>::new()),
                };
                stream.out().to_vec()
            }
        }
    }

    fn decode(bytes: &[u8]) -> ChainResult<Self> {
        let rlp = Rlp::new(bytes);
        match rlp.item_count()? {
            2 => {
                let encoded_path: Vec<u8> = rlp.val_at(0)?;
                let (path, is_leaf) = decode_hex_prefix(&encoded_path)?;
                if is_leaf {
                    Ok(Node::Leaf {
                        path,
                        value: rlp.val_at(1)?,
                    })
                } else {
                    let child: Vec<u8> = rlp.val_at(1)?;
                    Ok(Node::Extension {
                        path,
                        child: child.as_slice().try_into().map_err(|_| {
                            ChainError::MalformedPayload("trie child must be 32 bytes".into())
                        })?,
                    })
                }
            }
            17 => {
                let mut children: [Option<Hash>; 16] = Default::default();
                for (index, slot) in children.iter_mut().enumerate() {
                    let raw: Vec<u8> = rlp.val_at(index)?;
                    if !raw.is_empty() {
                        *slot = Some(raw.as_slice().try_into().map_err(|_| {
                            ChainError::MalformedPayload("trie child must be 32 bytes".into())
                        })?);
                    }
                }
                let raw_value: Vec<u8> = rlp.val_at(16)?;
                Ok(Node::Branch {
                    children: Box::new(children),
                    value: if raw_value.is_empty() {
                        None
                    } else {
                        Some(raw_value)
                    },
                })
            }
            count => Err(ChainError::MalformedPayload(format!(
                "trie node with {count} items"
            ))),
        }
    }
}

pub struct Trie {
    nodes: HashMap<Hash, Vec<u8>>,
    root: Option<Hash>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
        }
    }

    /// Rebuilds a trie from a persisted node map.
    pub fn from_parts(root: Hash, nodes: HashMap<Hash, Vec<u8>>) -> Self {
        let root = if root == empty_trie_root() {
            None
        } else {
            Some(root)
        };
        Self { nodes, root }
    }

    pub fn root_hash(&self) -> Hash {
        self.root.unwrap_or_else(empty_trie_root)
    }

    pub fn nodes(&self) -> &HashMap<Hash, Vec<u8>> {
        &self.nodes
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> ChainResult<()> {
        let path = to_nibbles(key);
        let root = self.root;
        let new_root = self.insert_at(root, &path, value)?;
        self.root = Some(new_root);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let path = to_nibbles(key);
        let mut remaining = path.as_slice();
        let mut current = match self.root {
            Some(root) => root,
            None => return Ok(None),
        };
        loop {
            match self.node(&current)? {
                Node::Leaf { path, value } => {
                    return Ok(if path == remaining { Some(value) } else { None });
                }
                Node::Extension { path, child } => {
                    if remaining.starts_with(&path) {
                        remaining = &remaining[path.len()..];
                        current = child;
                    } else {
                        return Ok(None);
                    }
                }
                Node::Branch { children, value } => {
                    if remaining.is_empty() {
                        return Ok(value);
                    }
                    match children[remaining[0] as usize] {
                        Some(child) => {
                            remaining = &remaining[1..];
                            current = child;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    fn node(&self, hash: &Hash) -> ChainResult<Node> {
        let bytes = self
            .nodes
            .get(hash)
            .ok_or_else(|| ChainError::TrieMissing(hex::encode_upper(hash)))?;
        Node::decode(bytes)
    }

    fn store(&mut self, node: Node) -> Hash {
        let bytes = node.encode();
        let hash = keccak(&bytes);
        self.nodes.insert(hash, bytes);
        hash
    }

    fn insert_at(&mut self, node: Option<Hash>, path: &[u8], value: Vec<u8>) -> ChainResult<Hash> {
        let Some(hash) = node else {
            return Ok(self.store(Node::Leaf {
                path: path.to_vec(),
                value,
            }));
        };
        match self.node(&hash)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    return Ok(self.store(Node::Leaf {
                        path: leaf_path,
                        value,
                    }));
                }
                let common = common_prefix(&leaf_path, path);
                let mut children: [Option<Hash>; 16] = Default::default();
                let mut branch_value = None;
                let leaf_rest = &leaf_path[common..];
                if leaf_rest.is_empty() {
                    branch_value = Some(leaf_value);
                } else {
                    let child = self.store(Node::Leaf {
                        path: leaf_rest[1..].to_vec(),
                        value: leaf_value,
                    });
                    children[leaf_rest[0] as usize] = Some(child);
                }
                let rest = &path[common..];
                if rest.is_empty() {
                    branch_value = Some(value);
                } else {
                    let child = self.store(Node::Leaf {
                        path: rest[1..].to_vec(),
                        value,
                    });
                    children[rest[0] as usize] = Some(child);
                }
                let branch = self.store(Node::Branch {
                    children: Box::new(children),
                    value: branch_value,
                });
                Ok(self.wrap_extension(&path[..common], branch))
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix(&ext_path, path);
                if common == ext_path.len() {
                    let new_child = self.insert_at(Some(child), &path[common..], value)?;
                    return Ok(self.store(Node::Extension {
                        path: ext_path,
                        child: new_child,
                    }));
                }
                let mut children: [Option<Hash>; 16] = Default::default();
                let mut branch_value = None;
                let ext_rest = &ext_path[common..];
                let reattached = if ext_rest.len() == 1 {
                    child
                } else {
                    self.store(Node::Extension {
                        path: ext_rest[1..].to_vec(),
                        child,
                    })
                };
                children[ext_rest[0] as usize] = Some(reattached);
                let rest = &path[common..];
                if rest.is_empty() {
                    branch_value = Some(value);
                } else {
                    let leaf = self.store(Node::Leaf {
                        path: rest[1..].to_vec(),
                        value,
                    });
                    children[rest[0] as usize] = Some(leaf);
                }
                let branch = self.store(Node::Branch {
                    children: Box::new(children),
                    value: branch_value,
                });
                Ok(self.wrap_extension(&path[..common], branch))
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return Ok(self.store(Node::Branch {
                        children,
                        value: Some(value),
                    }));
                }
                let index = path[0] as usize;
                let new_child = self.insert_at(children[index], &path[1..], value)?;
                children[index] = Some(new_child);
                Ok(self.store(Node::Branch {
                    children,
                    value: branch_value,
                }))
            }
        }
    }

    fn wrap_extension(&mut self, prefix: &[u8], child: Hash) -> Hash {
        if prefix.is_empty() {
            child
        } else {
            self.store(Node::Extension {
                path: prefix.to_vec(),
                child,
            })
        }
    }
}

fn to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2);
    for byte in key {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0F);
    }
    nibbles
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Hex-prefix encoding of a nibble path, flagging leaf vs extension and
/// odd vs even length in the first nibble.
fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let flag: u8 = if leaf { 2 } else { 0 };
    let mut out;
    if nibbles.len() % 2 == 0 {
        out = Vec::with_capacity(1 + nibbles.len() / 2);
        out.push(flag << 4);
        for pair in nibbles.chunks(2) {
            out.push(pair[0] << 4 | pair[1]);
        }
    } else {
        out = Vec::with_capacity(1 + nibbles.len() / 2);
        out.push((flag | 1) << 4 | nibbles[0]);
        for pair in nibbles[1..].chunks(2) {
            out.push(pair[0] << 4 | pair[1]);
        }
    }
    out
}

fn decode_hex_prefix(bytes: &[u8]) -> ChainResult<(Vec<u8>, bool)> {
    let first = *bytes
        .first()
        .ok_or_else(|| ChainError::MalformedPayload("empty hex-prefix path".into()))?;
    let flag = first >> 4;
    let leaf = flag & 2 != 0;
    let mut nibbles = Vec::with_capacity(bytes.len() * 2);
    if flag & 1 != 0 {
        nibbles.push(first & 0x0F);
    }
    for byte in &bytes[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0F);
    }
    Ok((nibbles, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(index: u64) -> Vec<u8> {
        rlp::encode(&index).to_vec()
    }

    #[test]
    fn empty_trie_has_canonical_root() {
        let trie = Trie::new();
        assert_eq!(trie.root_hash(), empty_trie_root());
    }

    #[test]
    fn inserted_values_are_retrievable() {
        let mut trie = Trie::new();
        for index in 0u64..40 {
            trie.insert(&key_for(index), format!("value-{index}").into_bytes())
                .unwrap();
        }
        for index in 0u64..40 {
            assert_eq!(
                trie.get(&key_for(index)).unwrap(),
                Some(format!("value-{index}").into_bytes())
            );
        }
        assert_eq!(trie.get(&key_for(99)).unwrap(), None);
    }

    #[test]
    fn replacing_a_value_updates_the_root() {
        let mut trie = Trie::new();
        trie.insert(b"key", b"one".to_vec()).unwrap();
        let first = trie.root_hash();
        trie.insert(b"key", b"two".to_vec()).unwrap();
        assert_ne!(trie.root_hash(), first);
        assert_eq!(trie.get(b"key").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn root_is_independent_of_insertion_order() {
        let mut forward = Trie::new();
        let mut backward = Trie::new();
        for index in 0u64..25 {
            forward
                .insert(&key_for(index), format!("v{index}").into_bytes())
                .unwrap();
        }
        for index in (0u64..25).rev() {
            backward
                .insert(&key_for(index), format!("v{index}").into_bytes())
                .unwrap();
        }
        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn prefix_keys_coexist() {
        let mut trie = Trie::new();
        trie.insert(&[0x12], b"short".to_vec()).unwrap();
        trie.insert(&[0x12, 0x34], b"long".to_vec()).unwrap();
        assert_eq!(trie.get(&[0x12]).unwrap(), Some(b"short".to_vec()));
        assert_eq!(trie.get(&[0x12, 0x34]).unwrap(), Some(b"long".to_vec()));
    }

    #[test]
    fn rebuilt_trie_resolves_lookups() {
        let mut trie = Trie::new();
        for index in 0u64..10 {
            trie.insert(&key_for(index), format!("v{index}").into_bytes())
                .unwrap();
        }
        let rebuilt = Trie::from_parts(trie.root_hash(), trie.nodes().clone());
        assert_eq!(rebuilt.root_hash(), trie.root_hash());
        assert_eq!(rebuilt.get(&key_for(7)).unwrap(), Some(b"v7".to_vec()));
    }

    #[test]
    fn missing_nodes_surface_as_trie_missing() {
        let mut trie = Trie::new();
        for index in 0u64..10 {
            trie.insert(&key_for(index), format!("v{index}").into_bytes())
                .unwrap();
        }
        let pruned = Trie::from_parts(trie.root_hash(), HashMap::new());
        let err = pruned.get(&key_for(3)).unwrap_err();
        assert!(matches!(err, ChainError::TrieMissing(_)));
    }
}

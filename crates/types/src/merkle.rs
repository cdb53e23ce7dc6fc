//! Binary Merkle tree used for anti-entropy.
//!
//! Replicas summarise their key space as a fixed number of buckets, hash each
//! bucket into a leaf, and compare trees top-down so that only subtrees whose
//! hashes differ are descended into. Two replicas with equal roots skip the
//! exchange entirely.

use crate::Hash;

/// Hash two child nodes to produce parent hash.
#[inline]
fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash::from_bytes(&data)
}

/// A complete binary Merkle tree, stored level by level.
///
/// `levels[0]` holds the root and `levels[depth]` holds the (padded) leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build a tree over `leaves`, padding to the next power of two with zero
    /// hashes. An empty leaf set yields a single zero leaf.
    pub fn build(leaves: &[Hash]) -> Self {
        let width = leaves.len().max(1).next_power_of_two();
        let mut bottom = vec![Hash::ZERO; width];
        bottom[..leaves.len()].copy_from_slice(leaves);

        let mut levels = vec![bottom];
        while levels.last().map_or(0, Vec::len) > 1 {
            let below = &levels[levels.len() - 1];
            let above: Vec<Hash> = below
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(above);
        }
        levels.reverse();

        Self { levels }
    }

    /// The root hash.
    pub fn root(&self) -> Hash {
        self.levels[0][0]
    }

    /// Number of levels below the root. The leaf level index equals the depth.
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Number of leaves, including padding.
    pub fn leaf_count(&self) -> usize {
        self.levels[self.depth()].len()
    }

    /// Hash of the node at `index` on `level` (0 = root).
    pub fn node(&self, level: usize, index: usize) -> Option<Hash> {
        self.levels.get(level)?.get(index).copied()
    }

    /// Indices of the children of `index` on `level`, if `level` is not the leaf level.
    pub fn children(&self, level: usize, index: usize) -> Option<[usize; 2]> {
        if level >= self.depth() || index >= self.levels[level].len() {
            return None;
        }
        Some([2 * index, 2 * index + 1])
    }

    /// Leaf indices whose hashes differ from `other`, found by descending only
    /// into mismatching subtrees.
    ///
    /// Trees of different shape cannot be compared structurally; every leaf
    /// index of the wider tree is reported instead.
    pub fn diff(&self, other: &MerkleTree) -> Vec<usize> {
        if self.depth() != other.depth() {
            return (0..self.leaf_count().max(other.leaf_count())).collect();
        }

        let mut frontier = vec![0usize];
        for level in 0..=self.depth() {
            frontier.retain(|&index| self.node(level, index) != other.node(level, index));
            if level == self.depth() || frontier.is_empty() {
                break;
            }
            frontier = frontier
                .iter()
                .flat_map(|&index| [2 * index, 2 * index + 1])
                .collect();
        }
        frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(|i| Hash::from_bytes(&[i])).collect()
    }

    #[test]
    fn test_single_leaf() {
        let leaf = Hash::from_bytes(b"single leaf");
        let tree = MerkleTree::build(&[leaf]);

        assert_eq!(tree.root(), leaf);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_two_leaves() {
        let leaf0 = Hash::from_bytes(b"leaf 0");
        let leaf1 = Hash::from_bytes(b"leaf 1");
        let tree = MerkleTree::build(&[leaf0, leaf1]);

        assert_eq!(tree.root(), hash_pair(&leaf0, &leaf1));
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.node(1, 0), Some(leaf0));
        assert_eq!(tree.node(1, 1), Some(leaf1));
        assert_eq!(tree.children(0, 0), Some([0, 1]));
        assert_eq!(tree.children(1, 0), None);
    }

    #[test]
    fn test_non_power_of_two_leaves_are_padded() {
        let tree = MerkleTree::build(&leaves(5));
        assert_eq!(tree.leaf_count(), 8);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.node(3, 7), Some(Hash::ZERO));
    }

    #[test]
    fn test_empty_tree() {
        let tree = MerkleTree::build(&[]);
        assert_eq!(tree.root(), Hash::ZERO);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_identical_trees_have_no_diff() {
        let a = MerkleTree::build(&leaves(8));
        let b = MerkleTree::build(&leaves(8));
        assert_eq!(a.root(), b.root());
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_finds_changed_leaves() {
        let base = leaves(8);
        let mut changed = base.clone();
        changed[2] = Hash::from_bytes(b"changed");
        changed[7] = Hash::from_bytes(b"also changed");

        let a = MerkleTree::build(&base);
        let b = MerkleTree::build(&changed);

        assert_ne!(a.root(), b.root());
        assert_eq!(a.diff(&b), vec![2, 7]);
        assert_eq!(b.diff(&a), vec![2, 7]);
    }

    #[test]
    fn test_diff_of_mismatched_shapes_reports_all_leaves() {
        let a = MerkleTree::build(&leaves(4));
        let b = MerkleTree::build(&leaves(8));
        assert_eq!(a.diff(&b), (0..8).collect::<Vec<_>>());
    }
}

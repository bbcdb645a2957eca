//! Binary regression trees shared by the forest and boosting families.
//!
//! Trees are grown by minimizing squared error on a per-row target. For 0/1 labels this is
//! the Gini criterion; for boosting the targets are residuals. The value stored in each
//! leaf is decided by the caller.

use rand::Rng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub(crate) enum Node {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f32,
    },
}

/// A fitted tree stored as a flat node list; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn leaf(value: f32) -> Self {
        Self {
            nodes: vec![Node::Leaf { value }],
        }
    }

    #[cfg(test)]
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    i = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Check that every split points forward to an existing node and reads a valid feature.
    ///
    /// Forward-only children rule out cycles, so [`Tree::predict`] always terminates.
    pub fn validate(&self, width: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::init("tree has no nodes"));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { value } if !value.is_finite() => {
                    return Err(Error::init(format!("leaf {i} is not finite")));
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let n = self.nodes.len();
                    if *feature >= width
                        || !threshold.is_finite()
                        || *left <= i
                        || *right <= i
                        || *left >= n
                        || *right >= n
                    {
                        return Err(Error::init(format!("split {i} is malformed")));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match &nodes[i] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means all of them.
    pub max_features: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 8,
            min_samples_split: 4,
            min_samples_leaf: 2,
            max_features: None,
        }
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f32,
    gain: f64,
}

pub(crate) struct Grower<'a, R> {
    rows: &'a [Vec<f32>],
    targets: &'a [f64],
    params: TreeParams,
    rng: &'a mut R,
    leaf_value: &'a dyn Fn(&[usize]) -> f64,
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl<'a, R: Rng> Grower<'a, R> {
    pub fn new(
        rows: &'a [Vec<f32>],
        targets: &'a [f64],
        params: TreeParams,
        rng: &'a mut R,
        leaf_value: &'a dyn Fn(&[usize]) -> f64,
    ) -> Self {
        Self {
            rows,
            targets,
            params,
            rng,
            leaf_value,
            nodes: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Grow a tree over the given row indices (repeats allowed, e.g. a bootstrap sample).
    pub fn grow(mut self, indices: Vec<usize>) -> Tree {
        if indices.is_empty() {
            return Tree::leaf(0.0);
        }
        self.build(indices, 0);
        Tree { nodes: self.nodes }
    }

    fn build(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value: 0.0 });

        let split = if depth < self.params.max_depth
            && indices.len() >= self.params.min_samples_split.max(2)
        {
            self.best_split(&indices)
        } else {
            None
        };

        let Some(split) = split else {
            let value = (self.leaf_value)(&indices) as f32;
            self.nodes[id] = Node::Leaf { value };
            return id;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][split.feature] <= split.threshold);

        let left = self.build(left_idx, depth + 1);
        let right = self.build(right_idx, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn best_split(&mut self, indices: &[usize]) -> Option<SplitChoice> {
        let width = self.rows[indices[0]].len();
        let k = self.params.max_features.unwrap_or(width).clamp(1, width);
        let features: Vec<usize> = if k == width {
            (0..width).collect()
        } else {
            sample(self.rng, width, k).into_vec()
        };

        let n = indices.len();
        let total: f64 = indices.iter().map(|&i| self.targets[i]).sum();
        let parent_score = total * total / n as f64;
        let min_leaf = self.params.min_samples_leaf.max(1);

        let mut best: Option<SplitChoice> = None;
        for f in features {
            self.order.clear();
            self.order.extend_from_slice(indices);
            let rows = self.rows;
            self.order.sort_by(|&a, &b| rows[a][f].total_cmp(&rows[b][f]));

            let mut left_sum = 0.0_f64;
            for pos in 1..n {
                left_sum += self.targets[self.order[pos - 1]];
                if pos < min_leaf || n - pos < min_leaf {
                    continue;
                }
                let (lo, hi) = (rows[self.order[pos - 1]][f], rows[self.order[pos]][f]);
                if lo >= hi {
                    continue;
                }

                let right_sum = total - left_sum;
                let score = left_sum * left_sum / pos as f64
                    + right_sum * right_sum / (n - pos) as f64;
                let gain = score - parent_score;
                if gain > 1e-12 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    let mid = lo + (hi - lo) / 2.0;
                    // Keep `lo` on the left even when the midpoint rounds up to `hi`.
                    let threshold = if mid < hi { mid } else { lo };
                    best = Some(SplitChoice {
                        feature: f,
                        threshold,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Validate a training set and return its feature width.
pub(crate) fn check_training_set(rows: &[Vec<f32>], targets: &[u8]) -> Result<usize> {
    let Some(first) = rows.first() else {
        return Err(Error::InvalidInput("training set is empty".into()));
    };
    if rows.len() != targets.len() {
        return Err(Error::InvalidInput(format!(
            "{} rows but {} targets",
            rows.len(),
            targets.len()
        )));
    }
    let width = first.len();
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(Error::DimensionMismatch {
            expected: width,
            actual: bad.len(),
        });
    }
    Ok(width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn mean_leaf(targets: &[f64]) -> impl Fn(&[usize]) -> f64 + '_ {
        move |idx| idx.iter().map(|&i| targets[i]).sum::<f64>() / idx.len().max(1) as f64
    }

    #[test]
    fn learns_a_threshold() {
        let rows: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32, 0.0]).collect();
        let targets: Vec<f64> = (0..20).map(|i| if i >= 12 { 1.0 } else { 0.0 }).collect();
        let leaf = mean_leaf(&targets);
        let mut rng = StdRng::seed_from_u64(1);
        let tree = Grower::new(&rows, &targets, TreeParams::default(), &mut rng, &leaf)
            .grow((0..20).collect());

        assert_eq!(tree.predict(&[3.0, 0.0]), 0.0);
        assert_eq!(tree.predict(&[15.0, 0.0]), 1.0);
        assert_eq!(tree.depth(), 1);
        assert!(tree.validate(2).is_ok());
    }

    #[test]
    fn validate_rejects_backward_children() {
        let tree = Tree::from_nodes(vec![
            Node::Split {
                feature: 0,
                threshold: 0.5,
                left: 0,
                right: 1,
            },
            Node::Leaf { value: 1.0 },
        ]);
        assert!(tree.validate(1).is_err());
    }

    #[test]
    fn constant_targets_make_a_single_leaf() {
        let rows: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32]).collect();
        let targets = vec![1.0; 10];
        let leaf = mean_leaf(&targets);
        let mut rng = StdRng::seed_from_u64(1);
        let tree = Grower::new(&rows, &targets, TreeParams::default(), &mut rng, &leaf)
            .grow((0..10).collect());
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict(&[4.0]), 1.0);
    }
}

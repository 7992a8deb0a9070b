//! LP to node placement.

use warpline_proto::{LpId, NodeId};

/// Static block partition of LPs over nodes.
///
/// LP ids are dense (`0..lps`). Node `n` hosts a contiguous block; the
/// first `lps % nodes` nodes take one extra LP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    nodes: u32,
    lps: u32,
}

impl Placement {
    /// Spread `lps` LPs over `nodes` nodes. Zero nodes is treated as one.
    pub fn block(nodes: u32, lps: u32) -> Self {
        Self { nodes: nodes.max(1), lps }
    }

    /// Number of nodes.
    pub fn nodes(&self) -> u32 {
        self.nodes
    }

    /// Number of LPs.
    pub fn lps(&self) -> u32 {
        self.lps
    }

    /// Node hosting `lp`, if it exists.
    pub fn node_of(&self, lp: LpId) -> Option<NodeId> {
        if lp >= self.lps {
            return None;
        }
        let base = self.lps / self.nodes;
        let extra = self.lps % self.nodes;
        let wide = extra * (base + 1);
        if lp < wide {
            Some(lp / (base + 1))
        } else {
            Some(extra + (lp - wide) / base)
        }
    }

    /// LPs hosted by `node`.
    pub fn lps_on(&self, node: NodeId) -> std::ops::Range<LpId> {
        if node >= self.nodes {
            return 0..0;
        }
        let base = self.lps / self.nodes;
        let extra = self.lps % self.nodes;
        let start = node * base + node.min(extra);
        let len = base + u32::from(node < extra);
        start..start + len
    }

    /// True if `lp` lives on `node`.
    pub fn is_local(&self, node: NodeId, lp: LpId) -> bool {
        self.node_of(lp) == Some(node)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn uneven_split() {
        let placement = Placement::block(3, 8);
        assert_eq!(placement.lps_on(0), 0..3);
        assert_eq!(placement.lps_on(1), 3..6);
        assert_eq!(placement.lps_on(2), 6..8);
        assert_eq!(placement.node_of(5), Some(1));
        assert_eq!(placement.node_of(7), Some(2));
        assert_eq!(placement.node_of(8), None);
    }

    proptest! {
        #[test]
        fn node_of_agrees_with_lps_on(nodes in 1u32..16, lps in 0u32..200) {
            let placement = Placement::block(nodes, lps);
            let mut seen = 0;
            for node in 0..nodes {
                for lp in placement.lps_on(node) {
                    prop_assert_eq!(placement.node_of(lp), Some(node));
                    seen += 1;
                }
            }
            prop_assert_eq!(seen, lps);
        }
    }
}

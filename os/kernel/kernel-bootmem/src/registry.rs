use crate::NodeId;
use crate::node::BootmemNode;
use kernel_info::memory::MAX_NUMNODES;

/// Registered nodes, indexed by id and linked in ascending `min_pfn` order.
///
/// Backed by fixed arrays: it exists before any allocator does.
pub(crate) struct NodeList<'m> {
    nodes: [Option<BootmemNode<'m>>; MAX_NUMNODES],
    /// Node ids sorted by `min_pfn`; only the first `len` are valid.
    order: [NodeId; MAX_NUMNODES],
    len: usize,
}

impl<'m> NodeList<'m> {
    pub const fn new() -> Self {
        Self {
            nodes: [const { None }; MAX_NUMNODES],
            order: [0; MAX_NUMNODES],
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Id of the `pos`-th node in address order.
    pub const fn id_at(&self, pos: usize) -> NodeId {
        self.order[pos]
    }

    pub fn get(&self, nid: NodeId) -> Option<&BootmemNode<'m>> {
        self.nodes.get(nid)?.as_ref()
    }

    pub fn get_mut(&mut self, nid: NodeId) -> Option<&mut BootmemNode<'m>> {
        self.nodes.get_mut(nid)?.as_mut()
    }

    /// Node at `pos` in address order.
    pub fn at_mut(&mut self, pos: usize) -> &mut BootmemNode<'m> {
        let nid = self.order[pos];
        match self.nodes[nid].as_mut() {
            Some(node) => node,
            None => unreachable!("linked node {nid} is not registered"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BootmemNode<'m>> {
        self.order[..self.len]
            .iter()
            .filter_map(|&nid| self.nodes[nid].as_ref())
    }

    /// Insert keeping address order. Overlapping or duplicate nodes are a
    /// setup bug.
    pub fn link(&mut self, node: BootmemNode<'m>) {
        let nid = node.nid();
        assert!(nid < MAX_NUMNODES, "bootmem: node id {nid} out of range");
        assert!(self.nodes[nid].is_none(), "bootmem: node {nid} registered twice");

        if let Some(other) = self
            .iter()
            .find(|o| node.min_pfn() < o.low_pfn() && o.min_pfn() < node.low_pfn())
        {
            panic!(
                "bootmem: node {nid} [{:?}, {:?}) overlaps node {} [{:?}, {:?})",
                node.min_pfn(),
                node.low_pfn(),
                other.nid(),
                other.min_pfn(),
                other.low_pfn()
            );
        }

        let pos = self.order[..self.len]
            .iter()
            .position(|&o| self.nodes[o].as_ref().is_some_and(|o| node.min_pfn() < o.min_pfn()))
            .unwrap_or(self.len);

        self.order.copy_within(pos..self.len, pos + 1);
        self.order[pos] = nid;
        self.len += 1;
        self.nodes[nid] = Some(node);
    }

    /// Remove a node from the list, handing it back.
    pub fn unlink(&mut self, nid: NodeId) -> Option<BootmemNode<'m>> {
        let node = self.nodes.get_mut(nid)?.take()?;
        if let Some(pos) = self.order[..self.len].iter().position(|&o| o == nid) {
            self.order.copy_within(pos + 1..self.len, pos);
            self.len -= 1;
        }
        Some(node)
    }

    /// Drain every node in address order.
    pub fn drain(&mut self) -> impl Iterator<Item = BootmemNode<'m>> + '_ {
        let len = core::mem::take(&mut self.len);
        let order = self.order;
        (0..len).filter_map(move |pos| self.nodes[order[pos]].take())
    }
}

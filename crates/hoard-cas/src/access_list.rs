//! Recency order of CAS entries.
//!
//! Nodes live in an arena and are addressed by stable `u32` indices, so a
//! `CasEntry` can hold its position without pointers into the list. An
//! unlinked node is outside the chain until touched again; a released node
//! goes on a free list and is handed out by the next `allocate`.

const NIL: u32 = u32::MAX;

struct Node<K> {
    key: K,
    prev: u32,
    next: u32,
    linked: bool,
}

pub struct AccessList<K> {
    nodes: Vec<Node<K>>,
    free: Vec<u32>,
    oldest: u32,
    newest: u32,
    len: usize,
}

impl<K: Copy> Default for AccessList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy> AccessList<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            oldest: NIL,
            newest: NIL,
            len: 0,
        }
    }

    /// Reserve a node for `key`. The node starts unlinked.
    pub fn allocate(&mut self, key: K) -> u32 {
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize].key = key;
            return index;
        }
        let index = self.nodes.len() as u32;
        self.nodes.push(Node {
            key,
            prev: NIL,
            next: NIL,
            linked: false,
        });
        index
    }

    /// Move `index` to the newest end, linking it if needed.
    pub fn touch(&mut self, index: u32) {
        if self.newest == index {
            return;
        }
        self.unlink(index);

        let node = &mut self.nodes[index as usize];
        node.prev = self.newest;
        node.next = NIL;
        node.linked = true;

        if self.newest != NIL {
            self.nodes[self.newest as usize].next = index;
        } else {
            self.oldest = index;
        }
        self.newest = index;
        self.len += 1;
    }

    pub fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let node = &mut self.nodes[index as usize];
            if !node.linked {
                return;
            }
            node.linked = false;
            let links = (node.prev, node.next);
            node.prev = NIL;
            node.next = NIL;
            links
        };

        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.oldest = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.newest = prev;
        }
        self.len -= 1;
    }

    /// Give `index` back. Its owner must not use it again.
    pub fn release(&mut self, index: u32) {
        self.unlink(index);
        self.free.push(index);
    }

    pub fn is_linked(&self, index: u32) -> bool {
        self.nodes
            .get(index as usize)
            .map(|node| node.linked)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Linked keys from oldest to newest.
    pub fn iter_oldest(&self) -> impl Iterator<Item = K> + '_ {
        let mut current = self.oldest;
        std::iter::from_fn(move || {
            if current == NIL {
                return None;
            }
            let node = &self.nodes[current as usize];
            current = node.next;
            Some(node.key)
        })
    }

    /// Copy of the current order, so callers can walk it without holding the list lock.
    pub fn snapshot(&self) -> Vec<K> {
        self.iter_oldest().collect()
    }
}

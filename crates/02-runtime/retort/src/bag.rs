//! The molecule bag: a per-site multiset of pending values.
//!
//! Each molecule kind keeps its pending values in emission (FIFO) order.
//! The bag itself is not synchronized; it is owned by a site and mutated
//! only under that site's lock.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::molecule::{EmissionId, MoleculeId};
use crate::reply::ReplyHandle;

/// One pending value awaiting consumption.
pub(crate) struct Pending {
    pub(crate) emission: EmissionId,
    pub(crate) value: Box<dyn Any + Send>,
    pub(crate) reply: Option<Arc<dyn ReplyHandle>>,
}

impl Pending {
    pub(crate) fn plain(value: Box<dyn Any + Send>) -> Self {
        Self {
            emission: EmissionId::next(),
            value,
            reply: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Bag {
    kinds: HashMap<MoleculeId, VecDeque<Pending>>,
}

impl Bag {
    pub(crate) fn insert(&mut self, molecule: MoleculeId, pending: Pending) {
        self.kinds.entry(molecule).or_default().push_back(pending);
    }

    /// Pending values of one kind, oldest first.
    pub(crate) fn queue(&self, molecule: MoleculeId) -> Option<&VecDeque<Pending>> {
        self.kinds.get(&molecule)
    }

    /// Removes one specific pending value, identified by its emission.
    pub(crate) fn remove(&mut self, molecule: MoleculeId, emission: EmissionId) -> Option<Pending> {
        let queue = self.kinds.get_mut(&molecule)?;
        let idx = queue.iter().position(|p| p.emission == emission)?;
        let pending = queue.remove(idx);
        if queue.is_empty() {
            self.kinds.remove(&molecule);
        }
        pending
    }

    pub(crate) fn depth(&self, molecule: MoleculeId) -> usize {
        self.kinds.get(&molecule).map_or(0, VecDeque::len)
    }

    pub(crate) fn total(&self) -> usize {
        self.kinds.values().map(VecDeque::len).sum()
    }

    pub(crate) fn depths(&self) -> impl Iterator<Item = (MoleculeId, usize)> + '_ {
        self.kinds.iter().map(|(id, queue)| (*id, queue.len()))
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::define_entity;
use crate::entity::{Arena, EntityRef};

use super::address::{calc_mask, Address, SeqNum, Space};
use super::op::OpId;

define_entity!(VarnodeId, "v");

/// Boolean attributes of a varnode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarnodeFlags {
    /// Formal entry value of the function. Changed only through the editor,
    /// since it is part of the index keys.
    #[serde(default)]
    pub(crate) input: bool,
    /// Storage is tied to a memory symbol: every write is observable.
    #[serde(default)]
    pub addr_tied: bool,
    /// Value persists beyond the function (globals).
    #[serde(default)]
    pub persist: bool,
    /// Placeholder reference (e.g. the call target of a CALL), never read as data.
    #[serde(default)]
    pub annotation: bool,
    /// Base register of a virtual space (stack pointer) or a constant
    /// relative to it. Spacebase constants may be read-shared.
    #[serde(default)]
    pub spacebase: bool,
    /// Poison placeholder substituted for reads of destroyed values.
    #[serde(default)]
    pub undefined: bool,
    /// Storage holding the return address on entry.
    #[serde(default)]
    pub return_address: bool,
}

impl VarnodeFlags {
    pub fn input(&self) -> bool {
        self.input
    }
}

/// Order of the definition states in both indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum DefClass {
    Input,
    Written,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LocKey {
    loc: Address,
    size: u32,
    class: DefClass,
    seq: Option<SeqNum>,
    id: VarnodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DefKey {
    class: DefClass,
    loc: Address,
    size: u32,
    seq: Option<SeqNum>,
    id: VarnodeId,
}

/// One SSA storage occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Varnode {
    pub(crate) loc: Address,
    pub(crate) size: u32,
    pub(crate) def: Option<OpId>,
    /// One entry per input slot reading this varnode.
    pub(crate) descend: Vec<OpId>,
    pub(crate) flags: VarnodeFlags,
    pub(crate) create_index: u32,
    pub(crate) nz_mask: u64,
    #[serde(skip)]
    pub(crate) keys: Option<(LocKey, DefKey)>,
}

impl Varnode {
    fn new(size: u32, loc: Address, create_index: u32) -> Self {
        let nz_mask = if loc.space == Space::Const {
            loc.offset & calc_mask(size)
        } else {
            calc_mask(size)
        };
        Self {
            loc,
            size,
            def: None,
            descend: Vec::new(),
            flags: VarnodeFlags::default(),
            create_index,
            nz_mask,
            keys: None,
        }
    }

    pub fn loc(&self) -> Address {
        self.loc
    }

    pub fn space(&self) -> Space {
        self.loc.space
    }

    pub fn offset(&self) -> u64 {
        self.loc.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn def(&self) -> Option<OpId> {
        self.def
    }

    pub fn descend(&self) -> &[OpId] {
        &self.descend
    }

    pub fn flags(&self) -> &VarnodeFlags {
        &self.flags
    }

    pub fn create_index(&self) -> u32 {
        self.create_index
    }

    /// Bits that may be non-zero, as computed by the last mask propagation.
    pub fn nz_mask(&self) -> u64 {
        self.nz_mask
    }

    pub fn is_constant(&self) -> bool {
        self.loc.space == Space::Const
    }

    pub fn constant_value(&self) -> Option<u64> {
        self.is_constant().then_some(self.loc.offset)
    }

    pub fn is_input(&self) -> bool {
        self.flags.input
    }

    /// Neither written nor an input.
    pub fn is_free(&self) -> bool {
        self.def.is_none() && !self.flags.input
    }

    pub fn is_addr_tied(&self) -> bool {
        self.flags.addr_tied
    }

    pub fn is_persist(&self) -> bool {
        self.flags.persist
    }

    pub fn is_spacebase(&self) -> bool {
        self.flags.spacebase
    }

    pub fn has_no_descend(&self) -> bool {
        self.descend.is_empty()
    }

    /// Storage of `self` and `other` share at least one byte.
    pub fn intersects(&self, other: &Varnode) -> bool {
        self.loc.overlaps(self.size, &other.loc, other.size)
    }

    pub(crate) fn def_class(&self) -> DefClass {
        if self.flags.input {
            DefClass::Input
        } else if self.def.is_some() {
            DefClass::Written
        } else {
            DefClass::Free
        }
    }

    pub(crate) fn erase_descend(&mut self, op: OpId) {
        if let Some(pos) = self.descend.iter().position(|&d| d == op) {
            self.descend.remove(pos);
        }
    }
}

/// Owner of every varnode of one function, indexed by storage location and
/// by definition state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueStore {
    nodes: Arena<VarnodeId, Varnode>,
    #[serde(skip)]
    by_loc: BTreeSet<LocKey>,
    #[serde(skip)]
    by_def: BTreeSet<DefKey>,
    create_count: u32,
    unique_next: u64,
}

/// First offset handed out for temporaries in the unique space.
const UNIQUE_BASE: u64 = 0x1000_0000;

impl Default for ValueStore {
    fn default() -> Self {
        Self {
            nodes: Arena::new(),
            by_loc: BTreeSet::new(),
            by_def: BTreeSet::new(),
            create_count: 0,
            unique_next: UNIQUE_BASE,
        }
    }
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a free, indexed varnode.
    pub(crate) fn create(&mut self, size: u32, loc: Address) -> VarnodeId {
        let vn = Varnode::new(size, loc, self.create_count);
        self.create_count += 1;
        let id = self.nodes.push(vn);
        self.index(id, None);
        id
    }

    /// Insert `id` into both indices using its current state. `def_seq` is
    /// the sequence number of the defining op, if written.
    pub(crate) fn index(&mut self, id: VarnodeId, def_seq: Option<SeqNum>) {
        let Some(vn) = self.nodes.get_mut(id) else {
            return;
        };
        let class = vn.def_class();
        let seq = if class == DefClass::Written { def_seq } else { None };
        let loc_key = LocKey {
            loc: vn.loc,
            size: vn.size,
            class,
            seq,
            id,
        };
        let def_key = DefKey {
            class,
            loc: vn.loc,
            size: vn.size,
            seq,
            id,
        };
        vn.keys = Some((loc_key, def_key));
        self.by_loc.insert(loc_key);
        self.by_def.insert(def_key);
    }

    /// Remove `id` from both indices, using the keys it was inserted with.
    pub(crate) fn unindex(&mut self, id: VarnodeId) {
        let Some(vn) = self.nodes.get_mut(id) else {
            return;
        };
        if let Some((loc_key, def_key)) = vn.keys.take() {
            self.by_loc.remove(&loc_key);
            self.by_def.remove(&def_key);
        }
    }

    pub(crate) fn remove(&mut self, id: VarnodeId) -> Option<Varnode> {
        self.unindex(id);
        self.nodes.remove(id)
    }

    pub(crate) fn node_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        &mut self.nodes[id]
    }

    pub(crate) fn next_unique(&mut self, size: u32) -> Address {
        let offset = self.unique_next;
        self.unique_next += (size.max(1) as u64 + 7) & !7;
        Address::new(Space::Unique, offset)
    }

    /// Drop every index entry, then re-insert all varnodes. `def_seq` maps a
    /// defining op to its sequence number.
    pub(crate) fn rebuild_indices(&mut self, def_seq: impl Fn(OpId) -> Option<SeqNum>) {
        self.by_loc.clear();
        self.by_def.clear();
        let ids: Vec<VarnodeId> = self.nodes.keys().collect();
        for id in ids {
            self.nodes[id].keys = None;
            let seq = self.nodes[id].def.and_then(&def_seq);
            self.index(id, seq);
        }
    }

    pub fn get(&self, id: VarnodeId) -> Option<&Varnode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: VarnodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Varnodes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (VarnodeId, &Varnode)> {
        self.nodes.iter()
    }

    /// Varnodes sorted by storage location, then size, then definition point.
    pub fn iter_by_loc(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.by_loc.iter().map(|k| k.id)
    }

    /// Varnodes grouped input, written, free; each group by location.
    pub fn iter_by_def(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.by_def.iter().map(|k| k.id)
    }

    /// All varnodes with exactly this storage.
    pub fn find_at(&self, loc: Address, size: u32) -> impl Iterator<Item = VarnodeId> + '_ {
        let start = LocKey {
            loc,
            size,
            class: DefClass::Input,
            seq: None,
            id: VarnodeId::new(0),
        };
        self.by_loc
            .range(start..)
            .take_while(move |k| k.loc == loc && k.size == size)
            .map(|k| k.id)
    }

    /// Input varnodes whose storage overlaps `[loc, loc+size)`.
    pub fn overlapping_inputs(&self, loc: Address, size: u32) -> Vec<VarnodeId> {
        let start = DefKey {
            class: DefClass::Input,
            loc: Address::new(loc.space, 0),
            size: 0,
            seq: None,
            id: VarnodeId::new(0),
        };
        self.by_def
            .range(start..)
            .take_while(|k| k.class == DefClass::Input && k.loc.space == loc.space)
            .filter(|k| k.loc.overlaps(k.size, &loc, size))
            .map(|k| k.id)
            .collect()
    }

    /// Number of index entries, for consistency checks.
    pub(crate) fn index_len(&self) -> (usize, usize) {
        (self.by_loc.len(), self.by_def.len())
    }
}

impl std::ops::Index<VarnodeId> for ValueStore {
    type Output = Varnode;
    fn index(&self, id: VarnodeId) -> &Varnode {
        &self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_index_orders_by_storage() {
        let mut store = ValueStore::new();
        let b = store.create(4, Address::register(8));
        let a = store.create(4, Address::register(0));
        let c = store.create(4, Address::constant(3));
        let order: Vec<_> = store.iter_by_loc().collect();
        assert_eq!(order, vec![c, a, b]);
    }

    #[test]
    fn reindex_moves_between_classes() {
        let mut store = ValueStore::new();
        let a = store.create(4, Address::register(0));
        let b = store.create(4, Address::register(0));
        store.unindex(b);
        store.node_mut(b).flags.input = true;
        store.index(b, None);
        // Inputs sort ahead of free varnodes at the same storage.
        assert_eq!(store.find_at(Address::register(0), 4).collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(store.iter_by_def().next(), Some(b));
        assert_eq!(store.overlapping_inputs(Address::register(2), 1), vec![b]);
        assert!(store.overlapping_inputs(Address::register(4), 4).is_empty());
    }

    #[test]
    fn remove_clears_indices() {
        let mut store = ValueStore::new();
        let a = store.create(1, Address::register(0));
        assert!(store.remove(a).is_some());
        assert_eq!(store.index_len(), (0, 0));
        assert!(store.get(a).is_none());
    }

    #[test]
    fn unique_offsets_do_not_overlap() {
        let mut store = ValueStore::new();
        let a = store.next_unique(4);
        let b = store.next_unique(8);
        assert!(!a.overlaps(4, &b, 8));
    }
}

//! Ordered, non-overlapping set of [`VmArea`]s.
//!
//! Areas live in a slot arena and are chained in address order through
//! `VmaId` handles, so linking and unlinking never move an area and never
//! search.

use super::VmError;
use super::area::{VmArea, VmFlags};
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

/// Stable handle to an area in a [`VmaList`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VmaId(u32);

#[derive(Debug)]
struct Node {
    area: VmArea,
    prev: Option<VmaId>,
    next: Option<VmaId>,
}

#[derive(Debug, Default)]
pub struct VmaList {
    slots: Vec<Option<Node>>,
    vacant: Vec<u32>,
    head: Option<VmaId>,
    tail: Option<VmaId>,
    len: usize,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, id: VmaId) -> Option<&Node> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn node_mut(&mut self, id: VmaId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    #[must_use]
    pub fn get(&self, id: VmaId) -> Option<&VmArea> {
        self.node(id).map(|n| &n.area)
    }

    /// Mutable access for permission and backing changes. The range must not
    /// be changed through this.
    pub(crate) fn get_mut(&mut self, id: VmaId) -> Option<&mut VmArea> {
        self.node_mut(id).map(|n| &mut n.area)
    }

    #[must_use]
    pub fn next(&self, id: VmaId) -> Option<VmaId> {
        self.node(id)?.next
    }

    /// Store `node` in a free slot.
    fn store(&mut self, node: Node) -> Result<VmaId, VmError> {
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot as usize] = Some(node);
            return Ok(VmaId(slot));
        }
        let slot = u32::try_from(self.slots.len())
            .map_err(|_| VmError::InvalidRange("too many areas"))?;
        self.slots.push(Some(node));
        Ok(VmaId(slot))
    }

    /// Link a stored, detached node between `prev` and `prev`'s successor.
    fn link_after(&mut self, prev: Option<VmaId>, id: VmaId) {
        let next = match prev {
            Some(p) => self.node(p).and_then(|n| n.next),
            None => self.head,
        };
        if let Some(n) = self.node_mut(id) {
            n.prev = prev;
            n.next = next;
        }
        match prev.and_then(|p| self.node_mut(p)) {
            Some(p) => p.next = Some(id),
            None => self.head = Some(id),
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(n) => n.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Add `area` at its place in address order.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] if the area is empty, not page aligned,
    /// overlaps an existing one, or carries [`VmFlags::IO`] without device
    /// backing (or the other way round).
    pub fn insert(&mut self, area: VmArea) -> Result<VmaId, VmError> {
        if area.is_empty() || !area.start.is_page_aligned() || !area.end.is_page_aligned() {
            return Err(VmError::InvalidRange("area empty or not page aligned"));
        }
        if area.flags.contains(VmFlags::IO) != area.is_device() {
            return Err(VmError::InvalidRange("IO flag and backing disagree"));
        }
        let mut prev = None;
        for (id, other) in self.iter() {
            if other.overlaps(area.start, area.end) {
                return Err(VmError::InvalidRange("area overlaps an existing one"));
            }
            if other.start >= area.end {
                break;
            }
            prev = Some(id);
        }
        let id = self.store(Node {
            area,
            prev: None,
            next: None,
        })?;
        self.link_after(prev, id);
        Ok(id)
    }

    /// Unlink and return the area; its handle becomes invalid.
    pub fn remove(&mut self, id: VmaId) -> Option<VmArea> {
        let node = self.slots.get_mut(id.0 as usize)?.take()?;
        match node.prev.and_then(|p| self.node_mut(p)) {
            Some(p) => p.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|n| self.node_mut(n)) {
            Some(n) => n.prev = node.prev,
            None => self.tail = node.prev,
        }
        self.vacant.push(id.0);
        self.len -= 1;
        Some(node.area)
    }

    /// Cut area `id` at `at`; the upper part gets a new handle, linked right
    /// after `id`.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] if `at` is not a page boundary strictly
    /// inside the area.
    pub fn split(&mut self, id: VmaId, at: VirtualAddress) -> Result<VmaId, VmError> {
        let area = self
            .get_mut(id)
            .ok_or(VmError::InvalidRange("no such area"))?;
        if !(area.start < at && at < area.end) || !at.is_page_aligned() {
            return Err(VmError::InvalidRange("split point outside the area"));
        }
        let upper = area.split_off(at);
        let new = self.store(Node {
            area: upper,
            prev: None,
            next: None,
        })?;
        self.link_after(Some(id), new);
        Ok(new)
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<VmaId> {
        self.iter()
            .take_while(|(_, a)| a.start <= va)
            .find(|(_, a)| a.contains(va))
            .map(|(id, _)| id)
    }

    /// Areas in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (VmaId, &VmArea)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            let node = self.node(id)?;
            cursor = node.next;
            Some((id, &node.area))
        })
    }

    /// Handles of every area overlapping `[start, end)`, in order.
    #[must_use]
    pub fn overlapping(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<VmaId> {
        self.iter()
            .take_while(|(_, a)| a.start < end)
            .filter(|(_, a)| a.overlaps(start, end))
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove every area, returning them in address order.
    pub fn drain(&mut self) -> Vec<VmArea> {
        let ids: Vec<_> = self.iter().map(|(id, _)| id).collect();
        let areas = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        self.slots.clear();
        self.vacant.clear();
        areas
    }
}

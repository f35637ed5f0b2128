// SPDX-License-Identifier: GPL-2.0 OR MIT

//! DRM MM range allocator
//!
//! C header: [`include/linux/drm/drm_mm.h`](../../../../include/linux/drm/drm_mm.h)
//!
//! The allocator manages a fixed `[start, start + size)` range and hands out non-overlapping
//! nodes from it. It does no locking of its own: like `struct drm_mm`, it is expected to live
//! inside whatever lock also protects the user's bookkeeping (for example an eviction list), so
//! that both change atomically.
//!
//! Eviction is supported through [`Scan`]: the user feeds candidate nodes with
//! [`Allocator::scan_add_block`] until a hole is found, then takes every candidate back out with
//! [`Allocator::scan_remove_block`], which reports the ones overlapping the hole. Only those
//! need to be removed for the new allocation to fit.

use crate::error::{code::*, Result};
use std::collections::BTreeMap;

/// Handle to an allocated node.
///
/// The handle is a plain value; the node data lives in the [`Allocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    start: u64,
    size: u64,
}

impl Node {
    /// Returns the start address of the node
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the size of the node in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the end address of the node (exclusive)
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Represents a single allocated node in the MM allocator
struct NodeData<T> {
    size: u64,
    color: usize,
    scanned: bool,
    inner: T,
}

/// Available MM node insertion modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    /// Search for the smallest hole (within the search range) that fits the desired node.
    ///
    /// Allocates the node from the bottom of the found hole.
    Best,

    /// Search for the lowest hole (address closest to 0, within the search range) that fits the
    /// desired node.
    ///
    /// Allocates the node from the bottom of the found hole.
    Low,

    /// Search for the highest hole (address closest to U64_MAX, within the search range) that fits
    /// the desired node.
    ///
    /// Allocates the node from the top of the found hole. The specified alignment for the node is
    /// applied to the base of the node (`Node.start()`).
    High,

    /// Search for the most recently evicted hole (within the search range) that fits the desired
    /// node. This is appropriate for use immediately after performing an eviction scan and removing
    /// the selected nodes to form a hole.
    ///
    /// Allocates the node from the bottom of the found hole.
    Evict,
}

fn align_up(val: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(val);
    }
    val.checked_add(alignment - 1)
        .map(|v| v / alignment * alignment)
}

fn align_down(val: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        val
    } else {
        val / alignment * alignment
    }
}

/// Returns where a node of `size` would be placed inside `[hole_start, hole_end)`.
fn fit(hole_start: u64, hole_end: u64, size: u64, alignment: u64, mode: InsertMode) -> Option<u64> {
    if hole_end < hole_start || hole_end - hole_start < size {
        return None;
    }

    match mode {
        InsertMode::High => {
            let start = align_down(hole_end - size, alignment);
            (start >= hole_start).then_some(start)
        }
        _ => {
            let start = align_up(hole_start, alignment)?;
            let end = start.checked_add(size)?;
            (end <= hole_end).then_some(start)
        }
    }
}

/// State of an eviction scan.
#[derive(Debug)]
pub struct Scan {
    size: u64,
    alignment: u64,
    color: usize,
    mode: InsertMode,
    range_start: u64,
    range_end: u64,
    hit_start: u64,
    hit_end: u64,
    found: bool,
    blocks: usize,
}

impl Scan {
    /// Returns the hole found by the scan, if any.
    pub fn hit(&self) -> Option<(u64, u64)> {
        self.found.then_some((self.hit_start, self.hit_end))
    }

    /// Returns the number of blocks still added to the scan.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Returns the color requested for the scan.
    pub fn color(&self) -> usize {
        self.color
    }
}

/// An instance of a DRM MM range allocator.
pub struct Allocator<T> {
    start: u64,
    size: u64,
    nodes: BTreeMap<u64, NodeData<T>>,
    scanned: usize,
    last_evicted: Option<u64>,
}

impl<T> Allocator<T> {
    /// Create a new range allocator for the given start and size range of addresses.
    pub fn new(start: u64, size: u64) -> Result<Allocator<T>> {
        if size == 0 || start.checked_add(size).is_none() {
            return Err(EINVAL);
        }

        Ok(Allocator {
            start,
            size,
            nodes: BTreeMap::new(),
            scanned: 0,
            last_evicted: None,
        })
    }

    /// Returns the first address managed by the allocator.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the size of the managed range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the end of the managed range (exclusive).
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Returns the total size of all allocated nodes.
    pub fn used(&self) -> u64 {
        self.nodes.values().map(|n| n.size).sum()
    }

    /// Returns `true` if no node is allocated.
    pub fn is_clean(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over all allocated nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = (Node, &T)> {
        self.nodes.iter().map(|(&start, d)| {
            (
                Node {
                    start,
                    size: d.size,
                },
                &d.inner,
            )
        })
    }

    /// Returns all free holes as `(start, end)` pairs in address order.
    pub fn holes(&self) -> Vec<(u64, u64)> {
        let mut holes = Vec::new();
        let mut prev_end = self.start;
        for (&start, d) in self.nodes.iter() {
            if start > prev_end {
                holes.push((prev_end, start));
            }
            prev_end = start + d.size;
        }
        if self.end() > prev_end {
            holes.push((prev_end, self.end()));
        }
        holes
    }

    fn data(&self, node: Node) -> Result<&NodeData<T>> {
        match self.nodes.get(&node.start) {
            Some(d) if d.size == node.size => Ok(d),
            _ => Err(ENOENT),
        }
    }

    fn data_mut(&mut self, node: Node) -> Result<&mut NodeData<T>> {
        match self.nodes.get_mut(&node.start) {
            Some(d) if d.size == node.size => Ok(d),
            _ => Err(ENOENT),
        }
    }

    /// Returns the user data of a node.
    pub fn get(&self, node: Node) -> Option<&T> {
        self.data(node).ok().map(|d| &d.inner)
    }

    /// Returns the user data of a node, mutably.
    pub fn get_mut(&mut self, node: Node) -> Option<&mut T> {
        self.data_mut(node).ok().map(|d| &mut d.inner)
    }

    /// Returns the color of the node (an opaque value)
    pub fn color(&self, node: Node) -> Option<usize> {
        self.data(node).ok().map(|d| d.color)
    }

    /// Insert a new node into the allocator of a given size.
    ///
    /// `node` is the user `T` type data to store into the node.
    pub fn insert_node(&mut self, node: T, size: u64) -> Result<Node> {
        self.insert_node_generic(node, size, 0, 0, InsertMode::Best)
    }

    /// Insert a new node into the allocator of a given size, with configurable alignment,
    /// color, and insertion mode.
    ///
    /// `node` is the user `T` type data to store into the node.
    pub fn insert_node_generic(
        &mut self,
        node: T,
        size: u64,
        alignment: u64,
        color: usize,
        mode: InsertMode,
    ) -> Result<Node> {
        self.insert_node_in_range(node, size, alignment, color, 0, u64::MAX, mode)
    }

    /// Insert a new node into the allocator of a given size, with configurable alignment,
    /// color, insertion mode, and sub-range to allocate from.
    ///
    /// Returns `ENOSPC` if no hole fits.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_in_range(
        &mut self,
        node: T,
        size: u64,
        alignment: u64,
        color: usize,
        start: u64,
        end: u64,
        mode: InsertMode,
    ) -> Result<Node> {
        if size == 0 || start >= end {
            return Err(EINVAL);
        }

        let holes: Vec<(u64, u64)> = self
            .holes()
            .into_iter()
            .map(|(s, e)| (s.max(start), e.min(end)))
            .filter(|(s, e)| s < e)
            .collect();

        let place = |hole: &(u64, u64)| fit(hole.0, hole.1, size, alignment, mode);

        let found = match mode {
            InsertMode::Low => holes.iter().find_map(place),
            InsertMode::High => holes.iter().rev().find_map(place),
            InsertMode::Best | InsertMode::Evict => {
                let evicted = match (mode, self.last_evicted) {
                    (InsertMode::Evict, Some(addr)) => holes
                        .iter()
                        .filter(|(s, e)| *s <= addr && addr < *e)
                        .find_map(place),
                    _ => None,
                };
                evicted.or_else(|| {
                    holes
                        .iter()
                        .filter_map(|h| place(h).map(|s| (h.1 - h.0, s)))
                        .min()
                        .map(|(_, s)| s)
                })
            }
        };

        let start = found.ok_or(ENOSPC)?;
        self.nodes.insert(
            start,
            NodeData {
                size,
                color,
                scanned: false,
                inner: node,
            },
        );

        Ok(Node { start, size })
    }

    /// Insert a node into the allocator at a fixed start address.
    ///
    /// Returns `ENOSPC` if the range is (partially) in use or outside the allocator.
    pub fn reserve_node(&mut self, node: T, start: u64, size: u64, color: usize) -> Result<Node> {
        let end = start.checked_add(size).ok_or(EINVAL)?;
        if size == 0 {
            return Err(EINVAL);
        }
        if start < self.start || end > self.end() {
            return Err(ENOSPC);
        }
        if let Some((&s, d)) = self.nodes.range(..end).next_back() {
            if s + d.size > start {
                return Err(ENOSPC);
            }
        }

        self.nodes.insert(
            start,
            NodeData {
                size,
                color,
                scanned: false,
                inner: node,
            },
        );

        Ok(Node { start, size })
    }

    /// Removes a node from the allocator, returning its user data.
    ///
    /// Nodes that are part of an active scan cannot be removed (`EBUSY`).
    pub fn remove_node(&mut self, node: Node) -> Result<T> {
        if self.data(node)?.scanned {
            return Err(EBUSY);
        }
        let data = self.nodes.remove(&node.start).ok_or(ENOENT)?;
        self.last_evicted = Some(node.start);
        Ok(data.inner)
    }

    /// Initializes an eviction scan over the whole range.
    pub fn scan_init(&self, size: u64, alignment: u64, color: usize, mode: InsertMode) -> Scan {
        self.scan_init_with_range(size, alignment, color, self.start, self.end(), mode)
    }

    /// Initializes an eviction scan restricted to `[start, end)`.
    pub fn scan_init_with_range(
        &self,
        size: u64,
        alignment: u64,
        color: usize,
        start: u64,
        end: u64,
        mode: InsertMode,
    ) -> Scan {
        Scan {
            size,
            alignment,
            color,
            mode,
            range_start: start.max(self.start),
            range_end: end.min(self.end()),
            hit_start: 0,
            hit_end: 0,
            found: false,
            blocks: 0,
        }
    }

    /// Adds a node to the eviction scan.
    ///
    /// The node is treated as free for the purpose of the scan. Returns `true` once the freed
    /// space around the node forms a hole that fits the scan request.
    pub fn scan_add_block(&mut self, scan: &mut Scan, node: Node) -> Result<bool> {
        let data = self.data_mut(node)?;
        if data.scanned {
            return Err(EBUSY);
        }
        data.scanned = true;
        self.scanned += 1;
        scan.blocks += 1;

        if scan.found {
            return Ok(true);
        }

        let hole_start = self
            .nodes
            .range(..node.start)
            .rev()
            .find(|(_, d)| !d.scanned)
            .map(|(&s, d)| s + d.size)
            .unwrap_or(self.start)
            .max(scan.range_start);
        let hole_end = self
            .nodes
            .range(node.start + 1..)
            .find(|(_, d)| !d.scanned)
            .map(|(&s, _)| s)
            .unwrap_or(self.end())
            .min(scan.range_end);

        match fit(hole_start, hole_end, scan.size, scan.alignment, scan.mode) {
            Some(start) => {
                scan.hit_start = start;
                scan.hit_end = start + scan.size;
                scan.found = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes a node from the eviction scan.
    ///
    /// Every node passed to [`Allocator::scan_add_block`] must be removed again before the
    /// allocator is modified. Returns `true` if the node overlaps the hole found by the scan and
    /// must therefore be evicted.
    pub fn scan_remove_block(&mut self, scan: &mut Scan, node: Node) -> Result<bool> {
        let data = self.data_mut(node)?;
        if !data.scanned {
            return Err(EINVAL);
        }
        data.scanned = false;
        self.scanned -= 1;
        scan.blocks -= 1;

        Ok(scan.found && node.start < scan.hit_end && node.end() > scan.hit_start)
    }
}

//! Fixed-capacity tensor arena.
//!
//! The arena is sized once in bytes and never grows. Activation tensors and
//! scratch buffers are carved from the head in `f32` words; per-node state
//! records are accounted from the tail so that long-lived bookkeeping never
//! fragments the working set. Every reservation is recorded so the host can
//! print an allocation report after graph construction.

use std::fmt;
use std::mem::size_of;

use crate::errors::{Result, RuntimeError};

const WORD_BYTES: usize = size_of::<f32>();

/// Rounds a byte count up to whole `f32` words.
pub fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(WORD_BYTES)
}

/// Word-addressed sub-range of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaRegion {
    pub offset: usize,
    pub len: usize,
}

impl ArenaRegion {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn bytes(&self) -> usize {
        self.len * WORD_BYTES
    }
}

/// What an arena reservation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Tensor,
    Scratch,
    Persistent,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AllocationKind::Tensor => "tensor",
            AllocationKind::Scratch => "scratch",
            AllocationKind::Persistent => "persistent",
        };
        f.write_str(label)
    }
}

/// One recorded reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub kind: AllocationKind,
    pub label: String,
    pub bytes: usize,
}

/// Disjoint views handed out for a single invocation.
#[derive(Debug)]
pub struct CarvedViews<'a> {
    pub reads: Vec<&'a [f32]>,
    pub writes: Vec<&'a mut [f32]>,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read(usize),
    Write(usize),
}

#[derive(Debug)]
pub struct Arena {
    words: Vec<f32>,
    capacity_bytes: usize,
    head: usize,
    tail_bytes: usize,
    allocations: Vec<Allocation>,
}

impl Arena {
    pub fn new(capacity_bytes: usize) -> Self {
        log::info!("arena init: capacity={} bytes", capacity_bytes);
        Self {
            words: vec![0.0; capacity_bytes / WORD_BYTES],
            capacity_bytes,
            head: 0,
            tail_bytes: 0,
            allocations: Vec::new(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.head * WORD_BYTES + self.tail_bytes
    }

    pub fn available_bytes(&self) -> usize {
        (self.words.len() * WORD_BYTES).saturating_sub(self.used_bytes())
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Reserves `bytes` (rounded up to whole words) from the head.
    pub fn allocate(
        &mut self,
        kind: AllocationKind,
        label: impl Into<String>,
        bytes: usize,
    ) -> Result<ArenaRegion> {
        let len = words_for(bytes);
        let available = self.available_bytes();
        if bytes > available || len * WORD_BYTES > available {
            return Err(RuntimeError::ArenaExhausted {
                requested: bytes,
                available,
            });
        }
        let region = ArenaRegion {
            offset: self.head,
            len,
        };
        self.head += len;
        self.allocations.push(Allocation {
            kind,
            label: label.into(),
            bytes: region.bytes(),
        });
        Ok(region)
    }

    /// Accounts `bytes` of node-lifetime bookkeeping against the tail.
    pub fn allocate_persistent(&mut self, label: impl Into<String>, bytes: usize) -> Result<()> {
        let available = self.available_bytes();
        if bytes > available {
            return Err(RuntimeError::ArenaExhausted {
                requested: bytes,
                available,
            });
        }
        let rounded = words_for(bytes) * WORD_BYTES;
        if rounded > available {
            return Err(RuntimeError::ArenaExhausted {
                requested: bytes,
                available,
            });
        }
        self.tail_bytes += rounded;
        self.allocations.push(Allocation {
            kind: AllocationKind::Persistent,
            label: label.into(),
            bytes: rounded,
        });
        Ok(())
    }

    pub fn slice(&self, region: ArenaRegion) -> &[f32] {
        &self.words[region.offset..region.end()]
    }

    pub fn slice_mut(&mut self, region: ArenaRegion) -> &mut [f32] {
        &mut self.words[region.offset..region.end()]
    }

    /// Splits the arena into one view per requested region.
    ///
    /// Read regions that are identical share a view. Any other overlap,
    /// including a write that touches a read, is rejected.
    pub fn carve(
        &mut self,
        reads: &[ArenaRegion],
        writes: &[ArenaRegion],
    ) -> Result<CarvedViews<'_>> {
        let mut order: Vec<(ArenaRegion, Access)> = reads
            .iter()
            .enumerate()
            .map(|(i, region)| (*region, Access::Read(i)))
            .chain(
                writes
                    .iter()
                    .enumerate()
                    .map(|(i, region)| (*region, Access::Write(i))),
            )
            .collect();
        order.sort_by_key(|(region, _)| (region.offset, region.len));

        if let Some((region, _)) = order.iter().find(|(r, _)| r.end() > self.words.len()) {
            return Err(RuntimeError::RegionOutOfBounds {
                offset: region.offset,
                len: region.len,
            });
        }

        let mut read_views: Vec<Option<&[f32]>> = vec![None; reads.len()];
        let mut write_views: Vec<Option<&mut [f32]>> = (0..writes.len()).map(|_| None).collect();
        let mut rest: &mut [f32] = &mut self.words;
        let mut cursor = 0;
        let mut last_read: Option<(ArenaRegion, &[f32])> = None;

        for (region, access) in order {
            if let (Access::Read(i), Some((previous, view))) = (access, last_read) {
                if previous == region {
                    read_views[i] = Some(view);
                    continue;
                }
            }
            if region.offset < cursor {
                return Err(RuntimeError::OverlappingRegions {
                    offset: region.offset,
                });
            }
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(region.offset - cursor);
            let (view, tail) = tail.split_at_mut(region.len);
            rest = tail;
            cursor = region.end();
            match access {
                Access::Read(i) => {
                    let view: &[f32] = view;
                    read_views[i] = Some(view);
                    last_read = Some((region, view));
                }
                Access::Write(i) => {
                    write_views[i] = Some(view);
                    last_read = None;
                }
            }
        }

        Ok(CarvedViews {
            reads: read_views.into_iter().flatten().collect(),
            writes: write_views.into_iter().flatten().collect(),
        })
    }

    pub fn report(&self) -> AllocationReport {
        AllocationReport {
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes(),
            allocations: self.allocations.clone(),
        }
    }
}

/// Snapshot of every reservation made in an arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReport {
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub allocations: Vec<Allocation>,
}

impl AllocationReport {
    pub fn total_bytes(&self, kind: AllocationKind) -> usize {
        self.allocations
            .iter()
            .filter(|allocation| allocation.kind == kind)
            .map(|allocation| allocation.bytes)
            .sum()
    }

    pub fn count(&self, kind: AllocationKind) -> usize {
        self.allocations
            .iter()
            .filter(|allocation| allocation.kind == kind)
            .count()
    }
}

impl fmt::Display for AllocationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "arena usage: {} / {} bytes",
            self.used_bytes, self.capacity_bytes
        )?;
        for allocation in &self.allocations {
            writeln!(
                f,
                "  [{:<10}] {:>8} bytes  {}",
                allocation.kind, allocation.bytes, allocation.label
            )?;
        }
        for kind in [
            AllocationKind::Tensor,
            AllocationKind::Scratch,
            AllocationKind::Persistent,
        ] {
            writeln!(
                f,
                "  total {:<10} {:>8} bytes in {} allocation(s)",
                kind,
                self.total_bytes(kind),
                self.count(kind)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_round_up_to_words() {
        let mut arena = Arena::new(64);
        let region = arena.allocate(AllocationKind::Scratch, "s", 5).unwrap();
        assert_eq!(region, ArenaRegion { offset: 0, len: 2 });
        assert_eq!(arena.used_bytes(), 8);
        assert_eq!(arena.available_bytes(), 56);
    }

    #[test]
    fn exhaustion_leaves_arena_untouched() {
        let mut arena = Arena::new(16);
        arena.allocate_persistent("state", 8).unwrap();
        let err = arena
            .allocate(AllocationKind::Tensor, "big", 12)
            .unwrap_err();
        match err {
            RuntimeError::ArenaExhausted {
                requested,
                available,
            } => {
                assert_eq!(requested, 12);
                assert_eq!(available, 8);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(arena.allocations().len(), 1);
        assert_eq!(arena.used_bytes(), 8);
    }

    #[test]
    fn near_max_requests_are_exhaustion() {
        let mut arena = Arena::new(64);
        assert!(matches!(
            arena.allocate(AllocationKind::Scratch, "huge", usize::MAX),
            Err(RuntimeError::ArenaExhausted { .. })
        ));
        assert!(matches!(
            arena.allocate_persistent("huge", usize::MAX - 1),
            Err(RuntimeError::ArenaExhausted { .. })
        ));
        assert!(arena.allocations().is_empty());
    }

    #[test]
    fn carve_shares_identical_reads() {
        let mut arena = Arena::new(64);
        let a = arena.allocate(AllocationKind::Tensor, "a", 8).unwrap();
        let b = arena.allocate(AllocationKind::Tensor, "b", 8).unwrap();
        arena.slice_mut(a).copy_from_slice(&[1.0, 2.0]);

        let views = arena.carve(&[a, a], &[b]).unwrap();
        assert_eq!(views.reads.len(), 2);
        assert_eq!(views.reads[0], &[1.0, 2.0]);
        assert_eq!(views.reads[1], &[1.0, 2.0]);
        let CarvedViews { mut writes, .. } = views;
        writes[0].copy_from_slice(&[3.0, 4.0]);
        assert_eq!(arena.slice(b), &[3.0, 4.0]);
    }

    #[test]
    fn carve_preserves_request_order() {
        let mut arena = Arena::new(64);
        let a = arena.allocate(AllocationKind::Tensor, "a", 4).unwrap();
        let b = arena.allocate(AllocationKind::Tensor, "b", 4).unwrap();
        arena.slice_mut(a)[0] = 1.0;
        arena.slice_mut(b)[0] = 2.0;

        let views = arena.carve(&[b, a], &[]).unwrap();
        assert_eq!(views.reads[0], &[2.0]);
        assert_eq!(views.reads[1], &[1.0]);
    }

    #[test]
    fn carve_rejects_write_aliasing_read() {
        let mut arena = Arena::new(64);
        let a = arena.allocate(AllocationKind::Tensor, "a", 8).unwrap();
        let err = arena.carve(&[a], &[a]).unwrap_err();
        assert!(matches!(err, RuntimeError::OverlappingRegions { offset: 0 }));
    }

    #[test]
    fn carve_rejects_partial_overlap() {
        let mut arena = Arena::new(64);
        arena.allocate(AllocationKind::Tensor, "a", 16).unwrap();
        let left = ArenaRegion { offset: 0, len: 3 };
        let right = ArenaRegion { offset: 2, len: 2 };
        assert!(arena.carve(&[left, right], &[]).is_err());
    }

    #[test]
    fn report_totals_by_kind() {
        let mut arena = Arena::new(128);
        arena.allocate(AllocationKind::Tensor, "input", 16).unwrap();
        arena.allocate(AllocationKind::Scratch, "node 0", 24).unwrap();
        arena.allocate_persistent("node 0 state", 10).unwrap();

        let report = arena.report();
        assert_eq!(report.total_bytes(AllocationKind::Tensor), 16);
        assert_eq!(report.total_bytes(AllocationKind::Scratch), 24);
        assert_eq!(report.total_bytes(AllocationKind::Persistent), 12);
        assert_eq!(report.used_bytes, 52);
        let text = report.to_string();
        assert!(text.contains("arena usage: 52 / 128 bytes"));
        assert!(text.contains("node 0 state"));
    }
}

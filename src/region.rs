//! Memory regions parsed from `/proc/<pid>/maps`.

use std::fmt;

use regex::Regex;

use crate::error::{FimError, Result};

/// Guard applied on both ends of a stack region at query time, so that
/// addresses landing in freshly grown stack pages between a refresh and a
/// probe still classify as in-range.
pub const STACK_GUARD_BYTES: u64 = 1024 * 1024;

const CANONICAL_FORM_MASK: u64 = 0xffff_0000_0000_0000;

/// Coarse origin of a pointer-sized word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerClass {
    /// `[heap]` region.
    Heap,
    /// `[stack]` region.
    Stack,
    /// Binary and library mappings.
    Static,
    /// Anonymous mapping with no name.
    Unknown,
}

impl fmt::Display for PointerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PointerClass::Heap => "heap",
            PointerClass::Stack => "stack",
            PointerClass::Static => "static",
            PointerClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One mapped region of the target's virtual address space, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub private: bool,
    pub mapping_name: String,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Containment with the query-time stack guard. Non-stack regions use
    /// their exact bounds.
    pub fn contains_padded(&self, addr: u64) -> bool {
        if self.pointer_class() == PointerClass::Stack {
            addr >= self.start.saturating_sub(STACK_GUARD_BYTES)
                && addr < self.end.saturating_add(STACK_GUARD_BYTES)
        } else {
            self.contains(addr)
        }
    }

    pub fn pointer_class(&self) -> PointerClass {
        if self.mapping_name.is_empty() {
            PointerClass::Unknown
        } else if self.mapping_name.contains("[heap]") {
            PointerClass::Heap
        } else if self.mapping_name.contains("[stack]") {
            PointerClass::Stack
        } else {
            PointerClass::Static
        }
    }
}

impl fmt::Display for Region {
    /// Renders in the maps-line shape: `start-end perms name`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x} {}{}{}{} {}",
            self.start,
            self.end,
            if self.readable { 'r' } else { '-' },
            if self.writable { 'w' } else { '-' },
            if self.executable { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
            self.mapping_name
        )
    }
}

/// Sorted views over the target's memory map as of the last refresh.
///
/// `readable` is the scan set; `all` is the overlap-merged target set used
/// by the pointer oracle.
#[derive(Debug, Default)]
pub struct RegionMap {
    readable: Vec<Region>,
    all: Vec<Region>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds both views from `/proc/<pid>/maps`. On failure the previous
    /// views are left intact.
    pub fn refresh(&mut self, pid: i32) -> Result<()> {
        let path = format!("/proc/{}/maps", pid);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| FimError::RefreshFailed(format!("{}: {}", path, e)))?;
        self.rebuild_from(&text)
    }

    /// Rebuilds both views from maps-format text. Split out from
    /// [`RegionMap::refresh`] so the parser is testable without a live pid.
    pub fn rebuild_from(&mut self, text: &str) -> Result<()> {
        let parsed = parse_maps(text);
        if parsed.is_empty() {
            return Err(FimError::RefreshFailed(
                "no parsable regions in maps data".to_string(),
            ));
        }

        let mut readable: Vec<Region> =
            parsed.iter().filter(|r| r.readable).cloned().collect();
        readable.sort_by_key(|r| r.start);

        let mut all = parsed;
        all.sort_by_key(|r| r.start);

        self.readable = readable;
        self.all = merge_regions(all);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.readable.clear();
        self.all.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Regions with the read bit, sorted by start, unmerged.
    pub fn readable(&self) -> &[Region] {
        &self.readable
    }

    /// All regions, sorted by start and overlap-merged.
    pub fn all(&self) -> &[Region] {
        &self.all
    }

    /// Binary search for the region containing `addr`, with the query-time
    /// stack guard applied.
    pub fn region_containing(&self, addr: u64) -> Option<&Region> {
        // First region with start > addr; the candidate that could contain
        // addr by its exact bounds sits right before it. A padded stack
        // region can additionally reach below its own start, so the region
        // at the partition point is checked as well.
        let idx = self.all.partition_point(|r| r.start <= addr);
        if idx > 0 && self.all[idx - 1].contains_padded(addr) {
            return Some(&self.all[idx - 1]);
        }
        if idx < self.all.len() && self.all[idx].contains_padded(addr) {
            return Some(&self.all[idx]);
        }
        None
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        self.region_containing(addr).is_some()
    }

    /// Heuristic "does this 64-bit word look like a pointer into the
    /// target". Pure function of the value and the current region set.
    pub fn looks_like_pointer(&self, value: u64) -> bool {
        if value == 0 {
            return false;
        }

        // Require at least 2-byte alignment.
        if value & 0x1 != 0 {
            return false;
        }

        // x86_64 canonical form: top 16 bits all-zero or all-one.
        let high_bits = value & CANONICAL_FORM_MASK;
        if high_bits != 0 && high_bits != CANONICAL_FORM_MASK {
            return false;
        }

        self.contains_address(value)
    }
}

/// Parses maps-format text, skipping lines that do not yield a valid
/// address pair and permission field.
fn parse_maps(text: &str) -> Vec<Region> {
    // start-end perms offset dev inode [name]; only the address pair, the
    // permission field, and the trailing name are semantically significant.
    let line_re = Regex::new(
        r"^([0-9a-f]+)-([0-9a-f]+)\s+([rwxps-]{4})(?:\s+\S+\s+\S+\s+\S+)?\s*(.*)$",
    )
    .expect("maps line pattern is valid");

    let mut regions = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_maps_line(&line_re, line) {
            Some(region) => regions.push(region),
            None => log::warn!("skipping unparsable maps line: {}", line),
        }
    }
    regions
}

fn parse_maps_line(line_re: &Regex, line: &str) -> Option<Region> {
    let caps = line_re.captures(line)?;

    let start = u64::from_str_radix(&caps[1], 16).ok()?;
    let end = u64::from_str_radix(&caps[2], 16).ok()?;
    if start >= end {
        return None;
    }

    let perms = caps[3].as_bytes();
    let mapping_name = caps
        .get(4)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    Some(Region {
        start,
        end,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
        private: perms[3] == b'p',
        mapping_name,
    })
}

/// Merges overlapping regions in a start-sorted list. Kernel-reported
/// adjacency is usually split anonymous fragments rather than a true
/// overlap, so a strict overlap gets a warning.
fn merge_regions(sorted: Vec<Region>) -> Vec<Region> {
    let mut merged: Vec<Region> = Vec::with_capacity(sorted.len());

    for region in sorted {
        match merged.last_mut() {
            Some(last) if last.end >= region.start => {
                if last.end > region.start {
                    log::warn!(
                        "strictly overlapping regions: {:#x}-{:#x} and {:#x}-{:#x}",
                        last.start,
                        last.end,
                        region.start,
                        region.end
                    );
                }
                // The first fragment keeps naming rights; permissions
                // accumulate across fragments.
                last.end = last.end.max(region.end);
                last.readable |= region.readable;
                last.writable |= region.writable;
                last.executable |= region.executable;
                last.private |= region.private;
            }
            _ => merged.push(region),
        }
    }

    merged
}

//! Bytewise checkpoint and restore of the target's writable memory.

use std::path::PathBuf;
use std::process::Command;

use crate::error::{FimError, Result};
use crate::ptrace::ProcessController;
use crate::region::Region;

/// One contiguous run of snapshotted bytes.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub address: u64,
    pub bytes: Vec<u8>,
}

impl MemoryChunk {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// User-space snapshot of every readable+writable region, restorable
/// bit-exactly while the layout has not drifted.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    chunks: Vec<MemoryChunk>,
    regions: Vec<Region>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn stored_bytes(&self) -> usize {
        self.chunks.iter().map(MemoryChunk::len).sum()
    }

    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    /// Snapshots the writable memory of the attached target, replacing any
    /// previous checkpoint. Non-writable regions are skipped; they do not
    /// need restoring. A failed region read clears the store.
    pub fn create(&mut self, controller: &mut ProcessController) -> Result<()> {
        if !controller.is_attached() {
            return Err(FimError::NotAttached);
        }
        controller.refresh_regions()?;

        let snapshot_regions = writable_regions(controller);
        let mut chunks = Vec::with_capacity(snapshot_regions.len());

        for region in &snapshot_regions {
            let mut bytes = vec![0u8; region.len() as usize];
            if let Err(e) = controller.read_memory(region.start, &mut bytes) {
                self.clear();
                log::error!(
                    "failed to snapshot region {:#x}-{:#x}: {}",
                    region.start,
                    region.end,
                    e
                );
                return Err(e);
            }
            chunks.push(MemoryChunk {
                address: region.start,
                bytes,
            });
        }

        log::info!(
            "checkpointed {} regions, {} bytes",
            snapshot_regions.len(),
            chunks.iter().map(MemoryChunk::len).sum::<usize>()
        );

        self.chunks = chunks;
        self.regions = snapshot_regions;
        Ok(())
    }

    /// Writes the snapshot back, returning the target's writable memory to
    /// its state at `create`.
    ///
    /// The current writable regions must match the snapshotted ones by
    /// start, end, and writability, in order; otherwise the layout has
    /// drifted and the restore refuses to run. A failed chunk write aborts
    /// with the chunks intact, so a retry may still succeed.
    pub fn restore(&self, controller: &mut ProcessController) -> Result<()> {
        if !controller.is_attached() {
            return Err(FimError::NotAttached);
        }
        if self.chunks.is_empty() {
            return Err(FimError::NoCheckpoint);
        }
        controller.refresh_regions()?;

        let current = writable_regions(controller);
        if !regions_match(&self.regions, &current) {
            return Err(FimError::RegionDrift);
        }

        for chunk in &self.chunks {
            controller
                .write_memory(chunk.address, &chunk.bytes)
                .map_err(|e| FimError::RestoreFailed(e.to_string()))?;
        }

        log::info!("restored {} regions from checkpoint", self.chunks.len());
        Ok(())
    }

    /// Discards the stored snapshot.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.regions.clear();
    }
}

fn writable_regions(controller: &ProcessController) -> Vec<Region> {
    controller
        .regions()
        .readable()
        .iter()
        .filter(|r| r.writable)
        .cloned()
        .collect()
}

fn regions_match(stored: &[Region], current: &[Region]) -> bool {
    stored.len() == current.len()
        && stored.iter().zip(current).all(|(a, b)| {
            a.start == b.start && a.end == b.end && a.writable == b.writable
        })
}

/// Full-process snapshot backend delegating to the external `criu` tool.
///
/// Selected at build time by the `criu` cargo feature; the public contract
/// is the same as [`CheckpointStore`]. Images live under
/// `/tmp/checkpoint_<pid>`.
#[derive(Debug)]
pub struct CriuCheckpoint {
    pid: i32,
}

impl CriuCheckpoint {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn image_dir(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/checkpoint_{}", self.pid))
    }

    /// Dumps the whole process, leaving it running. The tracer must let go
    /// while criu works, so the controller is detached for the duration and
    /// reattached iff it was attached on entry.
    pub fn create(&self, controller: &mut ProcessController) -> Result<()> {
        let was_attached = controller.is_attached();
        if was_attached {
            controller.detach()?;
        }

        let result = self.run_dump();

        if was_attached {
            if let Err(e) = controller.attach() {
                log::error!("failed to reattach after checkpoint: {}", e);
            }
        }
        result
    }

    pub fn restore(&self, controller: &mut ProcessController) -> Result<()> {
        if !self.image_dir().exists() {
            return Err(FimError::NoCheckpoint);
        }

        let was_attached = controller.is_attached();
        if was_attached {
            controller.detach()?;
        }

        let result = self.run_restore();

        if was_attached {
            if let Err(e) = controller.attach() {
                log::error!("failed to reattach after restore: {}", e);
            }
        }
        result
    }

    fn run_dump(&self) -> Result<()> {
        let dir = self.image_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| FimError::CheckpointFailed(format!("{}: {}", dir.display(), e)))?;

        let status = Command::new("criu")
            .arg("dump")
            .args(["--tree", &self.pid.to_string()])
            .arg("--images-dir")
            .arg(&dir)
            .args(["--shell-job", "--leave-running"])
            .args(["--log-file", "criu_dump.log"])
            .status()
            .map_err(|e| FimError::CheckpointFailed(format!("failed to run criu: {}", e)))?;

        if !status.success() {
            return Err(FimError::CheckpointFailed(format!(
                "criu dump exited with {}",
                status
            )));
        }
        Ok(())
    }

    fn run_restore(&self) -> Result<()> {
        let dir = self.image_dir();
        let status = Command::new("criu")
            .arg("restore")
            .arg("--images-dir")
            .arg(&dir)
            .args(["--shell-job", "--restore-detached"])
            .args(["--log-file", "criu_restore.log"])
            .status()
            .map_err(|e| FimError::RestoreFailed(format!("failed to run criu: {}", e)))?;

        if !status.success() {
            return Err(FimError::RestoreFailed(format!(
                "criu restore exited with {}",
                status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, writable: bool) -> Region {
        Region {
            start,
            end,
            readable: true,
            writable,
            executable: false,
            private: true,
            mapping_name: String::new(),
        }
    }

    // ==================== CheckpointStore Tests ====================

    #[test]
    fn test_store_starts_empty() {
        let store = CheckpointStore::new();
        assert!(store.is_empty());
        assert_eq!(store.chunk_count(), 0);
        assert_eq!(store.stored_bytes(), 0);
    }

    #[test]
    fn test_create_requires_attachment() {
        let mut store = CheckpointStore::new();
        let mut controller = ProcessController::new(1234).unwrap();
        assert!(matches!(
            store.create(&mut controller),
            Err(FimError::NotAttached)
        ));
    }

    #[test]
    fn test_restore_without_checkpoint_fails() {
        let store = CheckpointStore::new();
        let mut controller = ProcessController::new(1234).unwrap();
        // The attachment check fires first on a detached controller.
        assert!(matches!(
            store.restore(&mut controller),
            Err(FimError::NotAttached)
        ));
    }

    #[test]
    fn test_clear_discards_chunks() {
        let mut store = CheckpointStore {
            chunks: vec![MemoryChunk {
                address: 0x1000,
                bytes: vec![1, 2, 3],
            }],
            regions: vec![region(0x1000, 0x2000, true)],
        };
        assert_eq!(store.stored_bytes(), 3);

        store.clear();
        assert!(store.is_empty());
    }

    // ==================== Region Matching Tests ====================

    #[test]
    fn test_identical_regions_match() {
        let stored = vec![region(0x1000, 0x2000, true), region(0x3000, 0x4000, true)];
        assert!(regions_match(&stored, &stored.clone()));
    }

    #[test]
    fn test_moved_region_is_drift() {
        let stored = vec![region(0x1000, 0x2000, true)];
        let current = vec![region(0x1800, 0x2000, true)];
        assert!(!regions_match(&stored, &current));
    }

    #[test]
    fn test_grown_region_is_drift() {
        let stored = vec![region(0x1000, 0x2000, true)];
        let current = vec![region(0x1000, 0x3000, true)];
        assert!(!regions_match(&stored, &current));
    }

    #[test]
    fn test_extra_region_is_drift() {
        let stored = vec![region(0x1000, 0x2000, true)];
        let current = vec![region(0x1000, 0x2000, true), region(0x5000, 0x6000, true)];
        assert!(!regions_match(&stored, &current));
    }

    #[test]
    fn test_region_name_does_not_affect_matching() {
        let stored = vec![region(0x1000, 0x2000, true)];
        let mut current = stored.clone();
        current[0].mapping_name = "[heap]".to_string();
        assert!(regions_match(&stored, &current));
    }

    // ==================== CriuCheckpoint Tests ====================

    #[test]
    fn test_criu_image_dir_is_per_pid() {
        let checkpoint = CriuCheckpoint::new(4321);
        assert_eq!(
            checkpoint.image_dir(),
            PathBuf::from("/tmp/checkpoint_4321")
        );
    }
}

//! Parallel scan of the target's readable regions.

use std::thread;
use std::time::Instant;

use crate::error::{FimError, Result};
use crate::ptrace::ProcessController;
use crate::region::Region;
use crate::stats::ScanStats;
use crate::strategy::InjectionStrategy;

const WORD: usize = std::mem::size_of::<u64>();

/// Walks every readable region of the attached target, classifies each
/// aligned 8-byte word through the pointer oracle, and offers it to the
/// strategy. Modified pages of writable regions are written back whole.
///
/// Regions are dealt round-robin to `num_threads` workers (`region[i]` goes
/// to worker `i mod N`); each worker keeps private stats that are merged at
/// the end. Word order is ascending within a region; across regions it
/// depends on the partition and the scheduler.
///
/// Returns `Ok(None)` when the strategy's `pre_scan` cancels the pass. A
/// page-granular read failure only grows `bytes_skipped`; loss of the
/// attachment aborts the scan.
pub fn scan_for_pointers<S>(
    controller: &ProcessController,
    strategy: &S,
    num_threads: usize,
) -> Result<Option<ScanStats>>
where
    S: InjectionStrategy,
{
    if !controller.is_attached() {
        return Err(FimError::NotAttached);
    }
    if !strategy.pre_scan() {
        log::debug!("scan cancelled by strategy pre_scan");
        return Ok(None);
    }

    let start_time = Instant::now();
    let regions = controller.regions().readable();
    let num_threads = num_threads.max(1).min(regions.len().max(1));

    let worker_stats: Vec<Result<ScanStats>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_threads);
        for worker in 0..num_threads {
            handles.push(scope.spawn(move || -> Result<ScanStats> {
                let mut stats = ScanStats::default();
                let mut buffer = vec![0u8; controller.page_size()];
                for region in regions.iter().skip(worker).step_by(num_threads) {
                    scan_region(controller, region, strategy, &mut buffer, &mut stats)?;
                    stats.regions_scanned += 1;
                }
                Ok(stats)
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(Err(FimError::ThreadJoin)))
            .collect()
    });

    let mut merged = ScanStats::default();
    for stats in worker_stats {
        merged.merge(&stats?);
    }

    strategy.post_scan();
    merged.scan_time_ms = start_time.elapsed().as_millis() as i64;
    Ok(Some(merged))
}

fn scan_region<S>(
    controller: &ProcessController,
    region: &Region,
    strategy: &S,
    buffer: &mut [u8],
    stats: &mut ScanStats,
) -> Result<()>
where
    S: InjectionStrategy + ?Sized,
{
    strategy.set_current_region(region);

    let mut current = region.start;
    while current < region.end {
        let remaining = (region.end - current) as usize;
        let to_read = remaining.min(buffer.len());
        let page = &mut buffer[..to_read];

        match controller.read_memory(current, page) {
            Ok(()) => {}
            Err(FimError::NotAttached) => return Err(FimError::NotAttached),
            Err(e) => {
                log::debug!("skipping unreadable page at {:#x}: {}", current, e);
                stats.bytes_skipped += to_read as u64;
                current += to_read as u64;
                continue;
            }
        }

        let dirty = offer_page(controller, region, strategy, current, page, stats);

        stats.total_bytes_scanned += to_read as u64;
        stats.bytes_readable += to_read as u64;
        if region.writable {
            stats.bytes_writable += to_read as u64;
        }
        if region.executable {
            stats.bytes_executable += to_read as u64;
        }

        if dirty && region.writable {
            match controller.write_memory(current, page) {
                Ok(()) => {}
                Err(FimError::NotAttached) => return Err(FimError::NotAttached),
                Err(e) => log::warn!("page write-back at {:#x} failed: {}", current, e),
            }
        }

        current += to_read as u64;
    }

    Ok(())
}

/// Classifies every aligned word of one page and applies the strategy's
/// decisions to the buffer. Returns whether the buffer was modified.
fn offer_page<S>(
    controller: &ProcessController,
    region: &Region,
    strategy: &S,
    page_addr: u64,
    page: &mut [u8],
    stats: &mut ScanStats,
) -> bool
where
    S: InjectionStrategy + ?Sized,
{
    let mut dirty = false;
    let mut offset = 0;

    while offset + WORD <= page.len() {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&page[offset..offset + WORD]);
        let value = u64::from_ne_bytes(word);
        let addr = page_addr + offset as u64;

        let decision = if controller.regions().looks_like_pointer(value) {
            stats.pointers_found += 1;
            strategy.on_pointer(addr, value, region.writable, region)
        } else {
            strategy.on_nonpointer(addr, value, region.writable, region)
        };

        if let Some(new_value) = decision {
            if new_value != value {
                page[offset..offset + WORD].copy_from_slice(&new_value.to_ne_bytes());
                dirty = true;
            }
        }

        offset += WORD;
    }

    dirty
}

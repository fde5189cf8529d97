//! End-to-end paging: allocation, eviction down the tiers and restore.

use std::sync::atomic::Ordering;

use tempfile::TempDir;
use tiered_pager::{Block, Config, PagingContext, Tier};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(tmp: &TempDir, background_worker: bool) -> Config {
    init_tracing();
    let mut config = Config::default();
    config.paging.background_worker = background_worker;
    config.backing_store.directory = Some(tmp.path().to_path_buf());
    config
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
}

#[test]
fn test_resident_ceiling_evicts_oldest_page() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, false);
    cfg.tiers.max_resident = Some(1000);
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(150);

    let mut blocks: Vec<Block> = Vec::new();
    for i in 0..10u8 {
        let block = book.alloc(150).unwrap();
        block.write(&pattern(i, 150)).unwrap();
        blocks.push(block);

        if i == 6 {
            // 7 × 150 = 1050 > 1000: page 1 has to go.
            assert_eq!(blocks[0].tier(), Tier::Disk);
            assert!(blocks[1..].iter().all(|b| b.tier() == Tier::Resident));
        }
        assert!(ctx.tier_stats(Tier::Resident).bytes_used <= 1000);
    }
    assert_eq!(book.num_pages(), 10);

    // Everything reads back, wherever it ended up.
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.read().unwrap(), pattern(i as u8, 150));
    }
    assert!(ctx.tier_stats(Tier::Resident).bytes_used <= 1000);
    assert!(ctx.validate());
}

#[test]
fn test_resident_ceiling_with_background_worker() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, true);
    cfg.tiers.max_resident = Some(1000);
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(150);

    let blocks: Vec<Block> = (0..7).map(|_| book.alloc(150).unwrap()).collect();
    // Queued for disk, if not already there.
    assert_eq!(blocks[0].pending_tier(), Tier::Disk);
    assert!(ctx.tier_stats(Tier::Resident).bytes_used <= 1000);

    ctx.flush_background_worker();
    assert_eq!(blocks[0].tier(), Tier::Disk);
}

#[test]
fn test_disk_roundtrip_4096() {
    let tmp = TempDir::new().unwrap();
    let ctx = PagingContext::new(config(&tmp, true));
    let book = ctx.new_book(4096);
    let block = book.alloc(4096).unwrap();
    let data = pattern(7, 4096);
    block.write(&data).unwrap();

    block.request_tier(Tier::Disk).unwrap();
    ctx.flush_background_worker();
    assert_eq!(block.tier(), Tier::Disk);
    assert_eq!(block.page().memory_size(), 0);

    // Not resident yet: a restore is queued instead.
    assert!(block.get_pointer(false).unwrap().is_none());
    assert_eq!(block.pending_tier(), Tier::Resident);

    ctx.flush_background_worker();
    let view = block.get_pointer(false).unwrap().unwrap();
    assert_eq!(&view[..], &data[..]);
}

#[test]
fn test_forced_access_without_worker() {
    let tmp = TempDir::new().unwrap();
    let ctx = PagingContext::new(config(&tmp, false));
    let book = ctx.new_book(4096);
    let block = book.alloc(4096).unwrap();
    block.write(&pattern(9, 4096)).unwrap();
    block.request_tier(Tier::Disk).unwrap();

    // With no worker the restore runs inline.
    let view = block.get_pointer(false).unwrap().unwrap();
    assert_eq!(&view[..], &pattern(9, 4096)[..]);
}

#[test]
fn test_compressed_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, false);
    cfg.tiers.max_compressed = None;
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(8192);
    let block = book.alloc(8192).unwrap();
    let data = vec![0xAB; 8192];
    block.write(&data).unwrap();

    block.request_tier(Tier::Compressed).unwrap();
    assert_eq!(block.tier(), Tier::Compressed);
    let stats = ctx.tier_stats(Tier::Compressed);
    assert_eq!(stats.page_count, 1);
    assert!(stats.bytes_used < 8192);

    assert_eq!(block.read().unwrap(), data);
    assert_eq!(block.tier(), Tier::Resident);
}

#[test]
fn test_compressed_disk_roundtrip_keeps_form() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, false);
    cfg.tiers.max_compressed = None;
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(4096);
    let block = book.alloc(4096).unwrap();
    let data = pattern(3, 4096);
    block.write(&data).unwrap();

    block.request_tier(Tier::Compressed).unwrap();
    let compressed_size = block.page().memory_size();
    block.request_tier(Tier::Disk).unwrap();
    assert_eq!(
        ctx.backing_store().unwrap().used_bytes(),
        compressed_size
    );

    block.request_tier(Tier::Compressed).unwrap();
    assert_eq!(block.tier(), Tier::Compressed);
    assert_eq!(block.page().memory_size(), compressed_size);
    assert_eq!(block.read().unwrap(), data);
}

#[test]
fn test_eviction_cascades_through_compressed_tier() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, false);
    cfg.tiers.max_resident = Some(4096);
    cfg.tiers.max_compressed = Some(1);
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(4096);

    let first = book.alloc(4096).unwrap();
    first.write(&pattern(1, 4096)).unwrap();
    let _second = book.alloc(4096).unwrap();

    // Compressed, then immediately over the 1-byte compressed ceiling.
    assert_eq!(first.tier(), Tier::Disk);
    assert!(first.page().has_saved_block());
    assert_eq!(first.read().unwrap(), pattern(1, 4096));
}

#[test]
fn test_modified_block_is_written_again() {
    let tmp = TempDir::new().unwrap();
    let ctx = PagingContext::new(config(&tmp, false));
    let book = ctx.new_book(512);
    let block = book.alloc(512).unwrap();
    block.write(&pattern(1, 512)).unwrap();

    block.request_tier(Tier::Disk).unwrap();
    let store = ctx.backing_store().unwrap();
    assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 1);

    // Read-only access keeps the saved copy.
    assert_eq!(block.read().unwrap(), pattern(1, 512));
    block.request_tier(Tier::Disk).unwrap();
    assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 1);

    block.write(&pattern(2, 512)).unwrap();
    block.request_tier(Tier::Disk).unwrap();
    assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 2);
    assert_eq!(block.read().unwrap(), pattern(2, 512));
}

#[test]
fn test_stop_worker_with_queued_writes() {
    let tmp = TempDir::new().unwrap();
    let ctx = PagingContext::new(config(&tmp, true));
    let book = ctx.new_book(2048);

    let blocks: Vec<Block> = (0..16u8)
        .map(|i| {
            let block = book.alloc(2048).unwrap();
            block.write(&pattern(i, 2048)).unwrap();
            block
        })
        .collect();
    for block in &blocks {
        block.request_tier(Tier::Disk).unwrap();
    }

    ctx.stop_background_worker();
    assert_eq!(ctx.coordinator().pending_writes(), 0);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.tier(), Tier::Disk);
        assert_eq!(block.pending_tier(), Tier::Disk);
        assert_eq!(block.read().unwrap(), pattern(i as u8, 2048));
    }
}

#[test]
fn test_dropping_blocks_frees_disk_space() {
    let tmp = TempDir::new().unwrap();
    let ctx = PagingContext::new(config(&tmp, false));
    let book = ctx.new_book(1024);
    let block = book.alloc(1024).unwrap();
    block.request_tier(Tier::Disk).unwrap();
    let store = ctx.backing_store().unwrap();
    assert_eq!(store.used_bytes(), 1024);

    drop(block);
    assert_eq!(book.num_pages(), 0);
    assert_eq!(store.used_bytes(), 0);
    assert_eq!(ctx.tier_stats(Tier::Disk).page_count, 0);
}

#[test]
fn test_concurrent_writers() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, true);
    cfg.tiers.max_resident = Some(8 * 1024);
    cfg.tiers.max_compressed = Some(4 * 1024);
    let ctx = PagingContext::new(cfg);
    let book = ctx.new_book(1024);

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let book = &book;
            s.spawn(move || {
                let blocks: Vec<Block> = (0..16u8)
                    .map(|i| {
                        let block = book.alloc(512).unwrap();
                        block.write(&pattern(t * 16 + i, 512)).unwrap();
                        block
                    })
                    .collect();
                for (i, block) in blocks.iter().enumerate() {
                    assert_eq!(block.read().unwrap(), pattern(t * 16 + i as u8, 512));
                }
            });
        }
    });

    ctx.flush_background_worker();
    assert_eq!(book.num_pages(), 0);
    assert!(ctx.validate());
}

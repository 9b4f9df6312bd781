//! Property tests: every block of a random tree is prefetched exactly once
//! and the root completes with balanced counters.
//!
//! Run with: `cargo test --test count_conservation`

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use treeprefetch::block::{
    Block, BlockId, BlockInfo, BlockPointer, CacheLifetime, DirBlock, DirEntry, EntryType,
    FileBlock, KeyMetadata, VolumeId,
};
use treeprefetch::cache::{MemoryBlockCache, MemoryDiskCache, StoreRetriever};
use treeprefetch::config::PrefetcherConfig;
use treeprefetch::{PrefetchAction, PrefetchStatus, Prefetcher, PrefetcherDeps, Priority};

use common::RecordingFaults;

#[derive(Debug, Clone)]
struct TreeShape {
    depth: u32,
    fanout: usize,
    sizes: Vec<u32>,
    directory_root: bool,
}

fn tree_shape() -> impl Strategy<Value = TreeShape> {
    (1u32..=3, 1usize..=4, prop::collection::vec(1u32..=4096, 1..16), any::<bool>()).prop_map(
        |(depth, fanout, sizes, directory_root)| TreeShape {
            depth,
            fanout,
            sizes,
            directory_root,
        },
    )
}

struct Built {
    ids: Vec<BlockId>,
    bytes: u64,
}

/// Stores an indirect file subtree at `path` and returns its info.
fn build_file(
    store: &StoreRetriever,
    shape: &TreeShape,
    path: &str,
    level: u32,
    built: &mut Built,
) -> BlockInfo {
    let size = shape.sizes[built.ids.len() % shape.sizes.len()];
    let pointer = BlockPointer::new(BlockId::for_content(path.as_bytes()));
    let block = if level == shape.depth {
        Block::File(FileBlock::direct(Bytes::copy_from_slice(path.as_bytes()), size))
    } else {
        let mut children = Vec::new();
        for i in 0..shape.fanout {
            let child_path = format!("{path}/{i}");
            let child = build_file(store, shape, &child_path, level + 1, built);
            children.push(child);
        }
        Block::File(FileBlock::indirect(children, size))
    };
    built.ids.push(pointer.id);
    built.bytes += u64::from(size);
    store.insert(pointer, block);
    BlockInfo::new(pointer, size)
}

fn build_root(store: &StoreRetriever, shape: &TreeShape, built: &mut Built) -> (BlockPointer, Block) {
    let root = BlockPointer::new(BlockId::for_content(b"root"));
    let block = if shape.directory_root {
        let mut entries = std::collections::BTreeMap::new();
        for i in 0..shape.fanout {
            let info = build_file(store, shape, &format!("root/{i}"), 1, built);
            let entry = DirEntry::new(info, EntryType::File, u64::from(info.encoded_size));
            entries.insert(format!("file-{i}"), entry);
        }
        Block::Dir(DirBlock::direct(entries, 16))
    } else {
        let children = (0..shape.fanout)
            .map(|i| build_file(store, shape, &format!("root/{i}"), 1, built))
            .collect();
        Block::File(FileBlock::indirect(children, 16))
    };
    store.insert(root, block.clone());
    (root, block)
}

async fn prefetch_tree(shape: TreeShape) -> Result<(), TestCaseError> {
    let memory = Arc::new(MemoryBlockCache::default());
    let disk = Arc::new(MemoryDiskCache::unbounded());
    let store = StoreRetriever::new(Arc::clone(&memory), Arc::clone(&disk));
    let faults = Arc::new(RecordingFaults::default());
    let deps = PrefetcherDeps::new(Arc::new(store.clone()), memory)
        .with_disk_cache(disk.clone())
        .with_fault_handler(faults.clone());
    let prefetcher = Prefetcher::start(PrefetcherConfig::default(), deps);
    store.attach(prefetcher.clone());

    let mut built = Built {
        ids: Vec::new(),
        bytes: 0,
    };
    let (root, block) = build_root(&store, &shape, &mut built);

    prefetcher
        .process_block_for_prefetch(
            root,
            Arc::new(block),
            KeyMetadata::new(VolumeId(7), 1),
            Priority::ON_DEMAND,
            CacheLifetime::Transient,
            PrefetchStatus::NoPrefetch,
            PrefetchAction::WITH_DEEP_SYNC,
        )
        .await;
    let token = CancellationToken::new();
    let signal = prefetcher
        .wait_channel_for_block_prefetch(&token, root)
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    tokio::time::timeout(Duration::from_secs(10), signal.wait())
        .await
        .map_err(|_| TestCaseError::fail("root never completed"))?;

    prop_assert!(faults.violations().is_empty(), "{:?}", faults.violations());
    prop_assert_eq!(disk.prefetch_status(&root.id), Some(PrefetchStatus::Finished));
    for id in &built.ids {
        prop_assert_eq!(disk.prefetch_status(id), Some(PrefetchStatus::Finished));
    }
    let overall = prefetcher.overall_sync_status();
    prop_assert_eq!(overall.bytes_fetched, overall.bytes_total);
    prop_assert!(overall.bytes_total <= built.bytes);

    let progress = prefetcher
        .status(&token, root)
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(progress.bytes_total, 0);

    store.detach();
    prefetcher.shutdown().wait().await;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_random_tree_completes_with_balanced_counts(shape in tree_shape()) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(prefetch_tree(shape))?;
    }
}

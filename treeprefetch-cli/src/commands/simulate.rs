//! Simulate command - prefetch a synthetic block tree.
//!
//! The tree is a root directory with `fanout` entries; each entry is a file
//! whose indirect blocks go `depth` levels deep with `fanout` children per
//! block. Blocks are served from memory by a [`StoreRetriever`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::ValueEnum;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use treeprefetch::block::{
    Block, BlockId, BlockInfo, BlockPointer, CacheLifetime, DirBlock, DirEntry, EntryType,
    FileBlock, KeyMetadata, VolumeId,
};
use treeprefetch::cache::{MemoryBlockCache, MemoryDiskCache, Reporter, StoreRetriever};
use treeprefetch::config::parse_size;
use treeprefetch::logging::init_logging;
use treeprefetch::progress::SyncStatusSnapshot;
use treeprefetch::{CacheKind, PrefetchAction, PrefetchStatus, Prefetcher, PrefetcherDeps, Priority};

use super::load_config;
use crate::error::CliError;

/// Root action selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ActionArg {
    /// Sync the whole tree into the sync cache
    DeepSync,
    /// Prefetch only the root's immediate children
    Prefetch,
    /// Prefetch the whole tree, stopping when the cache is full
    UntilFull,
}

impl ActionArg {
    fn action(self) -> PrefetchAction {
        match self {
            ActionArg::DeepSync => PrefetchAction::WITH_DEEP_SYNC,
            ActionArg::Prefetch => PrefetchAction::WITH_PREFETCH,
            ActionArg::UntilFull => PrefetchAction::PREFETCH_UNTIL_FULL,
        }
    }
}

/// Arguments for the simulate command.
pub struct SimulateArgs {
    pub config: Option<std::path::PathBuf>,
    pub depth: u32,
    pub fanout: usize,
    pub block_size: String,
    pub sync_capacity: Option<String>,
    pub action: ActionArg,
    pub latency_ms: u64,
    pub timeout: u64,
    pub json: bool,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    let config = load_config(args.config.as_deref())?;
    let _log_guard = init_logging(&config.logging)?;

    let block_size = parse_size(&args.block_size)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or_else(|| CliError::Config(format!("invalid block size: {}", args.block_size)))?;
    let sync_capacity = args
        .sync_capacity
        .as_deref()
        .map(|text| {
            parse_size(text)
                .ok_or_else(|| CliError::Config(format!("invalid sync capacity: {}", text)))
        })
        .transpose()?;
    if args.fanout == 0 {
        return Err(CliError::Config("fanout must be at least 1".to_string()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(simulate(args, config.prefetch, block_size, sync_capacity))
}

async fn simulate(
    args: SimulateArgs,
    prefetch_config: treeprefetch::PrefetcherConfig,
    block_size: u32,
    sync_capacity: Option<u64>,
) -> Result<(), CliError> {
    let memory = Arc::new(MemoryBlockCache::default());
    let disk = Arc::new(match sync_capacity {
        Some(limit) => MemoryDiskCache::new(limit, u64::MAX),
        None => MemoryDiskCache::unbounded(),
    });
    let store = StoreRetriever::with_latency(
        Arc::clone(&memory),
        Arc::clone(&disk),
        Duration::from_millis(args.latency_ms),
    );

    let tree = SyntheticTree::build(&store, args.depth, args.fanout, block_size);
    println!("Simulating prefetch");
    println!("  Action:     {:?}", args.action);
    println!("  Blocks:     {}", tree.blocks);
    println!("  Tree bytes: {}", tree.bytes);
    match sync_capacity {
        Some(limit) => println!("  Sync cache: {} bytes", limit),
        None => println!("  Sync cache: unbounded"),
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} {msg}")
            .map_err(|e| CliError::Output(e.to_string()))?,
    );
    let reporter = Arc::new(BarReporter { bar: bar.clone() });

    let deps = PrefetcherDeps::new(Arc::new(store.clone()), memory)
        .with_disk_cache(disk.clone())
        .with_reporter(reporter);
    let prefetcher = Prefetcher::start(prefetch_config, deps);
    store.attach(prefetcher.clone());

    let stop = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            stop.cancel();
        })
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;
    }

    let started = Instant::now();
    prefetcher
        .process_block_for_prefetch(
            tree.root,
            Arc::new(tree.root_block.clone()),
            KeyMetadata::new(VolumeId(1), 1),
            Priority::ON_DEMAND,
            CacheLifetime::Transient,
            PrefetchStatus::NoPrefetch,
            args.action.action(),
        )
        .await;
    let signal = prefetcher
        .wait_channel_for_block_prefetch(&stop, tree.root)
        .await?;

    let timed_out = tokio::select! {
        _ = signal.wait() => false,
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_secs(args.timeout)) => true,
    };
    bar.finish_and_clear();

    store.detach();
    prefetcher.shutdown().wait().await;
    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "Simulation finished");

    let root_status = disk.prefetch_status(&tree.root.id);
    let overall = prefetcher.overall_sync_status();
    if args.json {
        let snapshot = Summary {
            finished: root_status == Some(PrefetchStatus::Finished),
            elapsed_ms: elapsed.as_millis() as u64,
            cached_blocks: disk.block_count(),
            bytes_fetched: overall.bytes_fetched,
            bytes_total: overall.bytes_total,
            sync_cache: disk_status(&disk),
        };
        let text = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CliError::Output(e.to_string()))?;
        println!("{}", text);
    } else {
        let outcome = if root_status == Some(PrefetchStatus::Finished) {
            style("finished").green().bold()
        } else if interrupted.load(Ordering::SeqCst) {
            style("interrupted").yellow().bold()
        } else {
            style("incomplete").red().bold()
        };
        println!("Prefetch {} in {:.2?}", outcome, elapsed);
        println!("  Cached blocks: {}/{}", disk.block_count(), tree.blocks + 1);
        println!(
            "  Sync progress: {}/{} bytes",
            overall.bytes_fetched, overall.bytes_total
        );
        let sync = disk_status(&disk);
        if sync.limit_bytes != u64::MAX {
            println!(
                "  Sync cache:    {} used, {} free",
                sync.used_bytes, sync.free_bytes
            );
        }
    }

    if timed_out {
        return Err(CliError::Timeout(args.timeout));
    }
    Ok(())
}

fn disk_status(disk: &MemoryDiskCache) -> treeprefetch::progress::DiskSpaceStatus {
    use treeprefetch::cache::DiskBlockCache;
    disk.space_status(CacheKind::Sync)
}

#[derive(serde::Serialize)]
struct Summary {
    finished: bool,
    elapsed_ms: u64,
    cached_blocks: usize,
    bytes_fetched: u64,
    bytes_total: u64,
    sync_cache: treeprefetch::progress::DiskSpaceStatus,
}

// ============================================================================
// Progress reporting
// ============================================================================

/// Feeds aggregate sync snapshots into a progress bar.
struct BarReporter {
    bar: ProgressBar,
}

impl Reporter for BarReporter {
    fn notify_overall_sync_status(&self, snapshot: SyncStatusSnapshot) {
        self.bar.set_length(snapshot.progress.bytes_total);
        self.bar.set_position(snapshot.progress.bytes_fetched);
        if snapshot.low_space {
            self.bar.set_message("sync cache low on space");
        }
    }
}

// ============================================================================
// Synthetic tree
// ============================================================================

struct SyntheticTree {
    root: BlockPointer,
    root_block: Block,
    /// Blocks below the root.
    blocks: u64,
    bytes: u64,
}

impl SyntheticTree {
    fn build(store: &StoreRetriever, depth: u32, fanout: usize, block_size: u32) -> Self {
        let mut tree = SyntheticTree {
            root: BlockPointer::new(BlockId::for_content(b"sim/root")),
            root_block: Block::File(FileBlock::default()),
            blocks: 0,
            bytes: 0,
        };

        let mut entries = std::collections::BTreeMap::new();
        for i in 0..fanout {
            let info = tree.build_file(store, &format!("sim/file-{}", i), 0, depth, fanout, block_size);
            let entry = DirEntry::new(info, EntryType::File, u64::from(block_size));
            entries.insert(format!("file-{}", i), entry);
        }
        tree.root_block = Block::Dir(DirBlock::direct(entries, block_size));
        store.insert(tree.root, tree.root_block.clone());
        tree
    }

    fn build_file(
        &mut self,
        store: &StoreRetriever,
        path: &str,
        level: u32,
        depth: u32,
        fanout: usize,
        block_size: u32,
    ) -> BlockInfo {
        let pointer = BlockPointer::new(BlockId::for_content(path.as_bytes()));
        let block = if level >= depth {
            Block::File(FileBlock::direct(Bytes::copy_from_slice(path.as_bytes()), block_size))
        } else {
            let children = (0..fanout)
                .map(|i| {
                    let child = format!("{}/{}", path, i);
                    self.build_file(store, &child, level + 1, depth, fanout, block_size)
                })
                .collect();
            Block::File(FileBlock::indirect(children, block_size))
        };
        store.insert(pointer, block);
        self.blocks += 1;
        self.bytes += u64::from(block_size);
        BlockInfo::new(pointer, block_size)
    }
}

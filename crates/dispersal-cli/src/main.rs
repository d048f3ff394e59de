// crates/dispersal-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dispersal_core::{Capability, Digest, DisperseError};
use dispersal_crawler::{Crawler, CrawlerConfig, CrawlerHooks};
use dispersal_crypto::{tagged_hash, tags};
use dispersal_downloader::{download, ShareReader};
use dispersal_encoder::{Encoder, EncoderParams, ShareWriter};
use dispersal_hashtree::HashTree;
use rand::RngCore;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "dispersal",
    about = "Erasure-coded, integrity-verified file dispersal",
    long_about = "Reference CLI for the dispersal erasure-coding core.\n\nUpload and download files against a local share directory, run the background share crawler, and exercise the hash-tree primitive standalone.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Disperse a file across `n` local shares, needing `k` to reconstruct.
    Upload {
        /// Plaintext input file.
        #[arg(long)]
        input: PathBuf,
        /// Directory holding one subdirectory per share (created if missing).
        #[arg(long)]
        sharedir: PathBuf,
        /// Shares needed to reconstruct.
        #[arg(long, default_value_t = 3)]
        k: u16,
        /// Minimum live shareholders required at every checkpoint.
        #[arg(long, default_value_t = 4)]
        happy: u16,
        /// Total shares produced.
        #[arg(long, default_value_t = 5)]
        n: u16,
        /// Upper bound on per-segment size, in bytes.
        #[arg(long, default_value_t = 128 * 1024)]
        max_segment_size: u32,
        /// Symmetric key, hex-encoded (16-32 bytes). A random key is
        /// generated and printed if omitted.
        #[arg(long)]
        key: Option<String>,
        /// Output path for the resulting capability string.
        #[arg(long, default_value = "capability.txt")]
        out_capability: PathBuf,
    },

    /// Reconstruct a file from a capability and a local share directory.
    Download {
        /// Path to a capability string previously written by `upload`.
        #[arg(long)]
        capability: PathBuf,
        /// Directory holding one subdirectory per share.
        #[arg(long)]
        sharedir: PathBuf,
        /// Output path for the reconstructed plaintext.
        #[arg(long)]
        out: PathBuf,
    },

    /// Run the rate-limited share crawler over a share directory's prefix tree.
    Crawl {
        /// Directory containing the 1024 prefix subdirectories.
        #[arg(long)]
        sharedir: PathBuf,
        /// Persistent checkpoint file.
        #[arg(long, default_value = "crawler-state.json")]
        statefile: PathBuf,
        /// Number of slices to run before exiting (0 runs until one full
        /// cycle completes).
        #[arg(long, default_value_t = 0)]
        slices: u32,
        /// Target fraction of wall-clock time spent working.
        #[arg(long, default_value_t = dispersal_crawler::DEFAULT_ALLOWED_CPU_PERCENTAGE)]
        allowed_cpu_percentage: f64,
        /// Maximum duration of one slice, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        cpu_slice_ms: u64,
        /// Minimum duration between the end of one cycle and the start of the next, in seconds.
        #[arg(long, default_value_t = 300)]
        minimum_cycle_time_secs: u64,
        /// Actually sleep between slices instead of running back-to-back
        /// (off by default so the command completes promptly for scripting).
        #[arg(long, default_value_t = false)]
        sleep: bool,
    },

    /// Build a standalone hash tree over newline-delimited hex-encoded leaves.
    HashTree {
        /// Input file, one hex-encoded leaf per line.
        #[arg(long)]
        input: PathBuf,
        /// Output path for the tree (root + all nodes) as JSON.
        #[arg(long, default_value = "tree.json")]
        out: PathBuf,
    },

    /// Verify one leaf against a tree produced by `hash-tree`.
    VerifyTree {
        /// Tree JSON produced by `hash-tree`.
        #[arg(long)]
        tree: PathBuf,
        /// Zero-based leaf index.
        #[arg(long)]
        leaf_index: usize,
        /// Hex-encoded raw leaf bytes (tagged the same way `hash-tree` did).
        #[arg(long)]
        leaf_hex: String,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Upload {
            input,
            sharedir,
            k,
            happy,
            n,
            max_segment_size,
            key,
            out_capability,
        } => upload(input, sharedir, k, happy, n, max_segment_size, key, out_capability),

        Cmd::Download {
            capability,
            sharedir,
            out,
        } => download_cmd(capability, sharedir, out),

        Cmd::Crawl {
            sharedir,
            statefile,
            slices,
            allowed_cpu_percentage,
            cpu_slice_ms,
            minimum_cycle_time_secs,
            sleep,
        } => crawl(
            sharedir,
            statefile,
            slices,
            allowed_cpu_percentage,
            cpu_slice_ms,
            minimum_cycle_time_secs,
            sleep,
        ),

        Cmd::HashTree { input, out } => hash_tree(input, out),

        Cmd::VerifyTree {
            tree,
            leaf_index,
            leaf_hex,
        } => verify_tree(tree, leaf_index, leaf_hex),
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating parent directory {}", dir.display()))?;
        }
    }
    Ok(())
}

/// Bounded worker count for fanning out per-share I/O: never more threads
/// than shares, never more than the machine actually offers.
fn worker_count(shares: usize) -> usize {
    let cap = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    shares.clamp(1, cap)
}

/// Run `f` over `items` using up to `worker_count` scoped worker threads,
/// splitting into contiguous chunks so the result preserves input order.
///
/// This is the CLI's demo fan-out across shares (directory setup on
/// upload, readiness probing on download) — a real transport would issue
/// the analogous per-share request concurrently the same way.
fn parallel_map<T, R>(items: Vec<T>, worker_count: usize, f: impl Fn(T) -> R + Sync) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
{
    let chunk_size = items.len().div_ceil(worker_count.max(1));
    if chunk_size == 0 {
        return Ok(Vec::new());
    }
    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut iter = items.into_iter();
    loop {
        let chunk: Vec<T> = (&mut iter).take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| scope.spawn(|| chunk.into_iter().map(&f).collect::<Vec<R>>()))
            .collect();
        let mut out = Vec::new();
        for handle in handles {
            let part = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
            out.extend(part);
        }
        Ok(out)
    })
}

// --------------------------------------------------------------------
// Local filesystem ShareWriter/ShareReader: a simple per-share directory
// layout used only by this CLI's demo storage path. It is not a protocol
// any remote peer implements; real deployments supply their own transport.
// --------------------------------------------------------------------

fn share_dir(sharedir: &Path, idx: u16) -> PathBuf {
    sharedir.join(idx.to_string())
}

struct LocalShareWriter {
    dir: PathBuf,
}

impl LocalShareWriter {
    fn put_named_hashes(&self, name: &str, hashes: &[(u64, Digest)]) -> Result<()> {
        let bytes = dispersal_core::io::to_canonical_cbor(&hashes)?;
        fs::write(self.dir.join(name), bytes)?;
        Ok(())
    }
}

impl ShareWriter for LocalShareWriter {
    fn put_block(&mut self, segment_index: u32, data: &[u8]) -> Result<()> {
        fs::write(self.dir.join("blocks").join(segment_index.to_string()), data)?;
        Ok(())
    }
    fn put_block_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
        self.put_named_hashes("block_hashes.cbor", hashes)
    }
    fn put_share_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
        self.put_named_hashes("share_hashes.cbor", hashes)
    }
    fn put_plaintext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
        self.put_named_hashes("plaintext_hashes.cbor", hashes)
    }
    fn put_crypttext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
        self.put_named_hashes("crypttext_hashes.cbor", hashes)
    }
    fn put_uri_extension(&mut self, bytes: &[u8]) -> Result<()> {
        fs::write(self.dir.join("uri_extension.cbor"), bytes)?;
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        fs::write(self.dir.join("closed"), b"")?;
        Ok(())
    }
}

struct LocalShareReader {
    dir: PathBuf,
}

impl LocalShareReader {
    fn get_named_hashes(&self, name: &str) -> Result<Vec<(u64, Digest)>> {
        let bytes = fs::read(self.dir.join(name))
            .with_context(|| format!("reading {}", self.dir.join(name).display()))?;
        dispersal_core::io::from_cbor(&bytes)
    }
}

impl ShareReader for LocalShareReader {
    fn get_uri_extension(&mut self) -> Result<Vec<u8>> {
        Ok(fs::read(self.dir.join("uri_extension.cbor"))?)
    }
    fn get_block_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
        self.get_named_hashes("block_hashes.cbor")
    }
    fn get_share_hash_chain(&mut self) -> Result<Vec<(u64, Digest)>> {
        self.get_named_hashes("share_hashes.cbor")
    }
    fn get_plaintext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
        self.get_named_hashes("plaintext_hashes.cbor")
    }
    fn get_crypttext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
        self.get_named_hashes("crypttext_hashes.cbor")
    }
    fn get_block(&mut self, segment_index: u32) -> Result<Vec<u8>> {
        Ok(fs::read(self.dir.join("blocks").join(segment_index.to_string()))?)
    }
}

#[allow(clippy::too_many_arguments)]
fn upload(
    input: PathBuf,
    sharedir: PathBuf,
    k: u16,
    happy: u16,
    n: u16,
    max_segment_size: u32,
    key: Option<String>,
    out_capability: PathBuf,
) -> Result<()> {
    let key = match key {
        Some(hex_key) => hex::decode(&hex_key).context("decoding --key as hex")?,
        None => {
            let mut bytes = vec![0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            println!("generated key: {}", hex::encode(&bytes));
            bytes
        }
    };

    let file_size = fs::metadata(&input)
        .with_context(|| format!("stat {}", input.display()))?
        .len();
    let source = File::open(&input).with_context(|| format!("open {}", input.display()))?;

    info!(k, happy, n, %file_size, "uploading");
    let mut encoder = Encoder::set_encrypted_uploadable(
        BufReader::new(source),
        file_size,
        key.clone(),
        EncoderParams {
            k,
            happy,
            n,
            max_segment_size,
        },
    )?;

    fs::create_dir_all(&sharedir)?;
    let dirs: Vec<(u16, PathBuf)> = (0..n).map(|idx| (idx, share_dir(&sharedir, idx))).collect();
    let created = parallel_map(dirs, worker_count(n as usize), |(idx, dir)| {
        fs::create_dir_all(dir.join("blocks"))
            .map(|()| (idx, dir))
            .map_err(|e| (idx, e))
    })?;

    let mut writers: HashMap<u16, Box<dyn ShareWriter>> = HashMap::new();
    for result in created {
        let (idx, dir) = result.map_err(|(idx, e)| {
            anyhow::Error::from(e).context(format!("creating share directory for index {idx}"))
        })?;
        writers.insert(idx, Box::new(LocalShareWriter { dir }));
    }
    encoder.set_shareholders(writers)?;

    let result = encoder.start()?;
    let capability = Capability::new(key, result.uri_extension_hash, result.k, result.n, result.file_size)?;

    ensure_parent_dir(&out_capability)?;
    fs::write(&out_capability, capability.to_uri_string())?;
    println!("Uploaded {} -> {}", input.display(), out_capability.display());
    Ok(())
}

fn download_cmd(capability_path: PathBuf, sharedir: PathBuf, out: PathBuf) -> Result<()> {
    let text = fs::read_to_string(&capability_path)
        .with_context(|| format!("reading capability from {}", capability_path.display()))?;
    let capability = Capability::from_uri_string(text.trim())?;

    let mut candidates: Vec<(u16, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&sharedir).with_context(|| format!("listing {}", sharedir.display()))? {
        let entry = entry?;
        let Ok(idx) = entry.file_name().to_string_lossy().parse::<u16>() else {
            continue;
        };
        candidates.push((idx, entry.path()));
    }

    // Probe each candidate share directory for a committed uri_extension
    // concurrently — the fan-out across shares that stands in for a real
    // transport's parallel per-share connection attempts.
    let workers = worker_count(candidates.len().max(1));
    let probed = parallel_map(candidates, workers, |(idx, dir)| {
        let ready = dir.join("uri_extension.cbor").is_file();
        (idx, dir, ready)
    })?;

    let mut readers: HashMap<u16, Box<dyn ShareReader>> = HashMap::new();
    for (idx, dir, ready) in probed {
        if ready {
            readers.insert(idx, Box::new(LocalShareReader { dir }));
        }
    }

    info!(sources = readers.len(), needed = capability.needed_shares, "downloading");
    ensure_parent_dir(&out)?;
    let mut target = BufWriter::new(File::create(&out).with_context(|| format!("create {}", out.display()))?);
    let (counters, _uri_ext) = download(&capability, readers, &mut target)?;
    target.flush()?;

    println!(
        "Downloaded -> {} (uri_extension failures={}, plaintext hashroot failures={})",
        out.display(),
        counters.uri_extension,
        counters.plaintext_hashroot
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn crawl(
    sharedir: PathBuf,
    statefile: PathBuf,
    slices: u32,
    allowed_cpu_percentage: f64,
    cpu_slice_ms: u64,
    minimum_cycle_time_secs: u64,
    sleep: bool,
) -> Result<()> {
    struct PrintingHooks {
        buckets_seen: u64,
    }
    impl CrawlerHooks for PrintingHooks {
        fn process_bucket(&mut self, cycle: u64, prefix: &str, _prefix_path: &Path, bucket: &str) {
            self.buckets_seen += 1;
            info!(cycle, prefix, bucket, "visited bucket");
        }
        fn finished_cycle(&mut self, cycle: u64) {
            println!("cycle {cycle} finished, {} buckets visited so far", self.buckets_seen);
        }
    }

    fs::create_dir_all(&sharedir)?;
    let config = CrawlerConfig {
        allowed_cpu_percentage,
        cpu_slice: Duration::from_millis(cpu_slice_ms),
        minimum_cycle_time: Duration::from_secs(minimum_cycle_time_secs),
    };
    let mut crawler = Crawler::new(sharedir, statefile, config)?;
    let mut hooks = PrintingHooks { buckets_seen: 0 };

    let mut ran = 0u32;
    loop {
        let sleep_for = crawler.run_slice(&mut hooks)?;
        ran += 1;
        let cycle_just_finished = crawler.state().current_cycle.is_none();
        if slices > 0 && ran >= slices {
            break;
        }
        if slices == 0 && cycle_just_finished {
            break;
        }
        if sleep {
            std::thread::sleep(sleep_for);
        }
    }

    println!(
        "Ran {ran} slice(s); last_cycle_finished={:?}",
        crawler.state().last_cycle_finished
    );
    Ok(())
}

fn hash_tree(input: PathBuf, out: PathBuf) -> Result<()> {
    let f = File::open(&input).with_context(|| format!("open {}", input.display()))?;
    let mut leaves = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw = hex::decode(line).with_context(|| format!("decoding leaf line {line:?} as hex"))?;
        leaves.push(tagged_hash(tags::BLOCK_LEAF, &raw));
    }

    let tree = HashTree::build(&leaves);
    let root = tree.root().context("built tree has no root")?;
    let nodes = tree.all_nodes();

    #[derive(serde::Serialize)]
    struct TreeDump {
        num_leaves: usize,
        padded_leaves: usize,
        root: String,
        nodes: Vec<(u64, String)>,
    }
    let dump = TreeDump {
        num_leaves: tree.num_leaves(),
        padded_leaves: tree.padded_leaves(),
        root: hex::encode(root),
        nodes: nodes.iter().map(|(i, h)| (*i, hex::encode(h))).collect(),
    };

    ensure_parent_dir(&out)?;
    let file = File::create(&out).with_context(|| format!("create {}", out.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &dump)?;

    println!("Built tree over {} leaves, root={}", dump.num_leaves, dump.root);
    Ok(())
}

fn verify_tree(tree_path: PathBuf, leaf_index: usize, leaf_hex: String) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct TreeDump {
        num_leaves: usize,
        root: String,
        nodes: Vec<(u64, String)>,
    }

    let f = File::open(&tree_path).with_context(|| format!("open {}", tree_path.display()))?;
    let dump: TreeDump = serde_json::from_reader(BufReader::new(f))?;

    let root_bytes = hex::decode(&dump.root).context("decoding root as hex")?;
    let root: Digest = root_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("root is not 32 bytes"))?;

    let mut partial = HashTree::empty_partial(dump.num_leaves);
    partial.set_root(root)?;
    for (idx, hex_hash) in &dump.nodes {
        let bytes = hex::decode(hex_hash).with_context(|| format!("decoding node {idx} as hex"))?;
        let digest: Digest = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node {idx} is not 32 bytes"))?;
        partial.set_hashes(&[(*idx, digest)])?;
    }

    let raw = hex::decode(&leaf_hex).context("decoding --leaf-hex")?;
    let leaf_hash = tagged_hash(tags::BLOCK_LEAF, &raw);

    match partial.verify(leaf_index, leaf_hash) {
        Ok(()) => {
            println!("OK: leaf {leaf_index} verifies against root {}", dump.root);
            Ok(())
        }
        Err(e @ DisperseError::BadHash { .. }) => {
            bail!("leaf {leaf_index} failed verification: {e}")
        }
        Err(e) => Err(e.into()),
    }
}

use clap::{Parser, Subcommand};
use solid7z::archive::{Archive, PackOptions};
use solid7z::codec::CodecId;
use solid7z::io_stream::reader::scan;
use solid7z::io_stream::{HeaderCompression, OpenOptions, SolidMode, Storage};
use solid7z::recovery::scanner::Verdict;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "solid7z", about = "Solid 7z-compatible archive tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files and directories into an archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: zstd (default), lz4, brotli, lzma, delta, copy
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        /// Compression level (zstd 1-22; brotli 0-11; ignored elsewhere)
        #[arg(short, long, default_value = "3")]
        level: i32,
        /// Solid block size in bytes: 0 = one block, negative = one per file
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        solid: i64,
        /// Split x86 branch targets into side streams before compressing
        #[arg(long)]
        filter: bool,
        /// Encrypt with AES-256-GCM (Argon2id key derivation)
        #[arg(short, long)]
        password: Option<String>,
        /// Keep the metadata uncompressed
        #[arg(long)]
        plain_header: bool,
        /// Add to an existing archive instead of creating one
        #[arg(short, long)]
        append: bool,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Unpack an archive
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        /// Decode blocks concurrently
        #[arg(short = 'j', long)]
        parallel: bool,
        /// Tolerate soft damage and relocate lost metadata
        #[arg(long)]
        recover: bool,
    },
    /// List archive contents
    List {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Decode every entry and check CRCs
    Test {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(long)]
        recover: bool,
    },
    /// Search the file tail for metadata of an unfinished archive
    Scan {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, codec, level, solid, filter, password, plain_header, append, input } => {
            let opts = PackOptions {
                codec: parse_codec(&codec),
                level,
                branch_filter: filter,
                solid: SolidMode::from_threshold(solid),
                header_compression: if plain_header { HeaderCompression::Never } else { HeaderCompression::default() },
                password,
                kdf: None,
            };
            let mut ar = if append { Archive::append(&output, opts)? } else { Archive::create(&output, opts)? };
            for path in &input {
                let name = entry_name(path);
                let added = ar.add_path(path, &name)?;
                println!("  packed  {} ({} entr{})", path.display(), added, if added == 1 { "y" } else { "ies" });
            }
            let len = ar.finalize()?;
            println!("{}: {} ({} B)", if append { "Updated" } else { "Created" }, output.display(), len);
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, password, parallel, recover } => {
            let mut ar = open_archive(&input, &password, recover)?;
            let n = if parallel {
                ar.extract_parallel(&output_dir, &scheduler())?
            } else {
                ar.extract_all(&output_dir)?
            };
            print_warnings(ar.warnings());
            println!("Unpacked {} entr{} to: {}", n, if n == 1 { "y" } else { "ies" }, output_dir.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, password, json } => {
            let ar = open_archive(&input, &password, false)?;
            let files = ar.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
                return Ok(());
            }
            println!("Archive: {}", input.display());
            println!("{:<40} {:>12} {:>9} {:>6}  Modified", "Name", "Size", "CRC", "Block");
            for info in files {
                let kind = if info.anti { "-" } else if info.directory { "/" } else { "" };
                println!("{:<40} {:>12} {:>9} {:>6}  {}",
                    format!("{}{}", info.name, kind),
                    info.size,
                    info.crc.as_deref().unwrap_or("-"),
                    info.block.map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
                    info.modified.as_deref().unwrap_or("-"));
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, password, json } => {
            let mut ar = open_archive(&input, &password, false)?;
            let s = ar.summary()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
                return Ok(());
            }
            println!("── 7z Archive ───────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Format version {}", s.version);
            println!("  File size      {} B", s.file_len);
            println!("  Entries        {} ({} files, {} directories)", s.entries, s.files, s.directories);
            println!("  Blocks         {}", s.blocks);
            println!("  Packed         {} B", s.packed_size);
            println!("  Unpacked       {} B", s.unpacked_size);
            println!("  Metadata       {} B", s.metadata_size);
            println!("  Encrypted      {}", s.encrypted);
            println!("  Methods        {}", s.methods.join(", "));
            print_warnings(&s.warnings);
        }

        // ── Test ─────────────────────────────────────────────────────────────
        Commands::Test { input, password, recover } => {
            let mut ar = open_archive(&input, &password, recover)?;
            let bytes = ar.test()?;
            print_warnings(ar.warnings());
            println!("Everything is Ok: {} entries, {} B", ar.list().len(), bytes);
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input, password } => {
            let storage: Arc<dyn Storage> = Arc::new(File::open(&input)?);
            let mut opts = OpenOptions::new().recovery(true);
            if let Some(pwd) = &password {
                opts = opts.password(pwd);
            }
            let (meta, report) = scan(&storage, &opts)?;
            println!("{}", report.summary());
            for c in &report.attempts {
                if let Verdict::Rejected(why) = &c.verdict {
                    println!("  {:>10}  {:?}  {}", c.position, c.pass, why);
                }
            }
            print_warnings(&report.warnings);
            println!("Recovered {} block(s), {} entr(ies):", meta.blocks.len(), meta.entries.len());
            for e in &meta.entries {
                println!("  {:>12}  {}", e.size, e.name);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_archive(path: &Path, password: &Option<String>, recover: bool) -> solid7z::Result<Archive> {
    let mut opts = OpenOptions::new().recovery(recover);
    if let Some(pwd) = password {
        opts = opts.password(pwd);
    }
    Archive::open_with(path, opts)
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to zstd", s);
        CodecId::Zstd
    })
}

fn print_warnings(warnings: &[String]) {
    for w in warnings {
        eprintln!("  warning: {w}");
    }
}

#[cfg(feature = "parallel")]
fn scheduler() -> solid7z::scheduler::RayonScheduler {
    solid7z::scheduler::RayonScheduler
}

#[cfg(not(feature = "parallel"))]
fn scheduler() -> solid7z::scheduler::ThreadScheduler {
    solid7z::scheduler::ThreadScheduler::named("solid7z-unpack")
}

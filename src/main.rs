use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zarchive::archive::Archive;
use zarchive::codec::CodecId;
use zarchive::io_stream::{WriterOptions, DEFAULT_COMPRESSION_LEVEL};

#[derive(Parser)]
#[command(name = "zarchive", about = "Random-access block-compressed archive CLI")]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files and directories into an archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: zstd (default) or none
        #[arg(short, long, default_value = "zstd", value_parser = parse_codec)]
        codec: CodecId,
        /// Zstd compression level (1-22)
        #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// Split the output into parts of at most this many MiB
        #[arg(long)]
        part_size: Option<u64>,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Extract every file of an archive
    Unpack {
        /// Archive path, or every part in order
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// List archive contents
    List {
        input: PathBuf,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
    },
    /// Write one file's content to stdout
    Cat {
        input: PathBuf,
        path:  String,
    },
    /// Print the BLAKE3 digest of every file
    Hash {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "zarchive=debug" } else { "zarchive=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, input, codec, level, part_size } => {
            let opts = WriterOptions { codec, level, max_part_size: part_size_bytes(part_size)? };
            let mut ar = Archive::create(&output, opts)?;
            for path in &input {
                let name = path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| format!("cannot pack {}", path.display()))?;
                if path.is_dir() {
                    ar.mkdir(&name, true)?;
                    let n = ar.add_dir_all(path, &name)?;
                    println!("  packed  {} ({n} files)", path.display());
                } else {
                    ar.add_reader(&name, std::fs::File::open(path)?)?;
                    println!("  packed  {}", path.display());
                }
            }
            for part in ar.finalize()? {
                println!("Created: {}", part.display());
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir } => {
            let mut ar = open_archive(&input)?;
            let n = ar.extract_all(&output_dir)?;
            println!("Unpacked {n} files to: {}", output_dir.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let ar = Archive::open(&input)?;
            let files = ar.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                println!("Archive: {}", input.display());
                println!("{:<48} {:>12} {:>14}", "Path", "Size", "Offset");
                for f in &files {
                    println!("{:<48} {:>12} {:>14}", f.path, f.size, f.offset);
                }
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ar = Archive::open(&input)?;
            let info = ar.info()?;
            let f = &info.footer;
            println!("── Archive ──────────────────────────────────────────────");
            println!("  Path            {}", ar.path().display());
            println!("  Parts           {}", info.parts.len());
            println!("  Total size      {} B", info.total_size);
            println!("  Version         {:#010x}", f.version);
            println!("  File tree       {} B @ {} ({} nodes)", f.file_tree.size, f.file_tree.offset, info.node_count);
            println!("  Name table      {} B @ {} ({} names)", f.names.size, f.names.offset, info.name_count);
            println!("  Offset records  {} B @ {} ({} records)",
                f.offset_records.size, f.offset_records.offset, info.record_count);
            println!("  Files           {}", info.file_count);
            println!("  Content         {} B", info.content_bytes);
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { input, path } => {
            let mut ar = Archive::open(&input)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            ar.extract_to(&path, &mut out)?;
            out.flush()?;
        }

        // ── Hash ─────────────────────────────────────────────────────────────
        Commands::Hash { input } => {
            let mut ar = Archive::open(&input)?;
            for f in ar.list()? {
                println!("{}  {}", ar.content_hash(&f.path)?, f.path);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_archive(input: &[PathBuf]) -> Result<Archive, Box<dyn std::error::Error>> {
    Ok(match input {
        [single] => Archive::open(single)?,
        parts    => Archive::open_parts(parts)?,
    })
}

fn part_size_bytes(mib: Option<u64>) -> Result<Option<u64>, String> {
    mib.map(|m| m.checked_mul(1024 * 1024).ok_or_else(|| format!("--part-size {m} MiB is too large")))
        .transpose()
}

fn parse_codec(s: &str) -> Result<CodecId, String> {
    CodecId::from_name(s).ok_or_else(|| format!("unknown codec '{s}' (expected zstd or none)"))
}

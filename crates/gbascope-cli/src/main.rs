//! gbascope - Inspect the structure of GBA cartridge images
//!
//! This tool loads cartridge images, infers pointers, compressed assets and
//! data tables, and reports or extracts what it found.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, ValueEnum};
use gbascope_core::media::DEFAULT_PALETTE;
use gbascope_core::run::AssetKind;
use gbascope_core::{Artifact, CharacterTable, EngineConfig, RunKind, Session};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Inspect pointers, compressed assets and data tables in GBA cartridge images
#[derive(Parser, Debug)]
#[command(name = "gbascope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    input: InputMode,

    /// Output directory for extracted assets
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "summary")]
    format: OutputFormat,

    /// Search for hex bytes or text; may be given several times
    #[arg(long = "find", value_name = "TERM")]
    find: Vec<String>,

    /// Character table file with lines like 0xBB='A'
    #[arg(long)]
    charmap: Option<PathBuf>,

    /// Minimum element count for variable-length tables
    #[arg(long, default_value = "10")]
    min_array_len: usize,

    /// Write decompressed palettes and images to the output directory
    #[arg(long)]
    extract: bool,

    /// Dry run - don't write files, just show what would be extracted
    #[arg(long)]
    dry_run: bool,

    /// Overwrite existing files without prompting
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single cartridge image
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of .gba images to process
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

/// What to print for each image
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Load statistics, timings and shortcuts
    Summary,
    /// One line per registered run
    Runs,
    /// Just the asset file names (for scripting)
    Filename,
}

/// Written assets keyed by content, so a palette or image shared by
/// several images is extracted once
#[derive(Default)]
struct AssetIndex {
    seen: HashMap<blake3::Hash, PathBuf>,
    found: usize,
    duplicates: usize,
    written: usize,
}

impl AssetIndex {
    fn new() -> Self {
        Self::default()
    }

    /// Takes `path` for `content`, or `None` if the same bytes already have one
    fn claim(&mut self, path: PathBuf, content: &[u8]) -> Option<PathBuf> {
        self.found += 1;
        match self.seen.entry(blake3::hash(content)) {
            Entry::Occupied(first) => {
                debug!("{} repeats {}", path.display(), first.get().display());
                self.duplicates += 1;
                None
            }
            Entry::Vacant(slot) => Some(slot.insert(path).clone()),
        }
    }

    fn log_summary(&self) {
        info!(
            "Summary: {} assets found, {} repeats skipped, {} written",
            self.found, self.duplicates, self.written
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let config = engine_config(&cli)?;

    if let Some(ref file) = cli.input.file {
        process_single_file(&cli, &config, file)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, &config, directory)
    } else {
        bail!("Either --file or --directory must be specified")
    }
}

fn engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::new().min_array_len(cli.min_array_len);
    if let Some(ref path) = cli.charmap {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read character table: {}", path.display()))?;
        let charmap = CharacterTable::parse(&text)
            .with_context(|| format!("Invalid character table: {}", path.display()))?;
        config = config.charmap(charmap);
    }
    Ok(config)
}

fn writes_assets(cli: &Cli) -> bool {
    cli.extract && !cli.dry_run && cli.format != OutputFormat::Filename
}

fn process_single_file(cli: &Cli, config: &EngineConfig, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let mut assets = AssetIndex::new();
    process_rom(cli, config, file, &mut assets)?;

    if writes_assets(cli) {
        assets.log_summary();
    }

    Ok(())
}

fn process_directory(cli: &Cli, config: &EngineConfig, directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut assets = AssetIndex::new();
    let mut roms_processed = 0;

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden || !is_rom(path) {
            trace!("Skipping: {}", path.display());
            continue;
        }

        debug!("Processing image: {}", path.display());
        if let Err(e) = process_rom(cli, config, path, &mut assets) {
            warn!("Error processing {}: {:#}", path.display(), e);
        }
        roms_processed += 1;
    }

    info!("Processed {} images", roms_processed);

    if writes_assets(cli) {
        assets.log_summary();
    }

    Ok(())
}

fn is_rom(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gba"))
}

fn process_rom(
    cli: &Cli,
    config: &EngineConfig,
    rom_path: &Path,
    assets: &mut AssetIndex,
) -> Result<()> {
    trace!("Reading {}", rom_path.display());
    let session = Session::open(rom_path, config.clone())
        .with_context(|| format!("Failed to open image: {}", rom_path.display()))?;
    let report = session
        .load_blocking()
        .with_context(|| format!("Failed to load image: {}", rom_path.display()))?;

    match cli.format {
        OutputFormat::Summary => {
            println!(
                "{}: {} ({} bytes)",
                rom_path.display(),
                session.profile(),
                session.len()
            );
            println!(
                "  {} runs, {} pointer candidates, {} claimed destinations, {} conflicts",
                report.runs,
                report.candidates,
                report.claimed_destinations,
                report.conflicts.len()
            );
            for step in &report.steps {
                println!(
                    "  {:<10} {:>7} runs {:>10.2?}",
                    step.parser, step.runs_added, step.elapsed
                );
            }
            for (name, location) in session.shortcuts() {
                println!("  {:<20} {:#08X}", name, location);
            }
        }
        OutputFormat::Runs => {
            for (start, run) in session.runs() {
                let len = session.block_length(start).unwrap_or(0);
                match session.label(start) {
                    Some(label) => println!("{:#08X} {:>6} {} {}", start, len, run.kind(), label),
                    None => println!("{:#08X} {:>6} {}", start, len, run.kind()),
                }
            }
        }
        OutputFormat::Filename => {}
    }

    for conflict in &report.conflicts {
        debug!("Conflict at {:#X}: {}", conflict.destination, conflict.reason);
    }

    for term in &cli.find {
        let hits: Vec<String> = session
            .find_by_term(term)
            .into_iter()
            .map(|at| format!("{:#08X}", at))
            .collect();
        println!("find {:?}: {}", term, hits.join(" "));
    }

    if cli.extract || cli.format == OutputFormat::Filename {
        extract_assets(cli, &session, rom_path, assets)?;
    }

    Ok(())
}

/// Rendered bytes and file name for a compressed asset run
fn render_asset(session: &Session, start: usize, kind: AssetKind) -> Option<(String, Vec<u8>)> {
    let artifact = session.artifact(start)?;
    match (kind, artifact.as_ref()) {
        (AssetKind::Palette, Artifact::Palette(palette)) => Some((
            format!("{}_{:06X}.pal", kind, start),
            palette.to_jasc().into_bytes(),
        )),
        (AssetKind::Image, Artifact::Image(image)) => Some((
            format!("{}_{:06X}.ppm", kind, start),
            image.to_ppm(&DEFAULT_PALETTE),
        )),
        _ => None,
    }
}

fn extract_assets(
    cli: &Cli,
    session: &Session,
    rom_path: &Path,
    assets: &mut AssetIndex,
) -> Result<()> {
    for (start, run) in session.runs() {
        let RunKind::Compressed(kind) = *run.kind() else {
            continue;
        };
        let Some((filename, content)) = render_asset(session, start, kind) else {
            trace!("No {} artifact at {:#X}", kind, start);
            continue;
        };

        if cli.format == OutputFormat::Filename {
            println!("{}", filename);
            continue;
        }

        let Some(output_path) = assets.claim(asset_dir(&cli.output, rom_path).join(&filename), &content)
        else {
            continue;
        };

        if cli.dry_run {
            println!("Would write: {} ({} bytes)", output_path.display(), content.len());
            continue;
        }
        match write_asset_file(&output_path, &content, cli.force) {
            Ok(()) => {
                println!("Wrote {}", output_path.display());
                assets.written += 1;
            }
            Err(e) => {
                error!("Failed to write {}: {:#}", output_path.display(), e);
            }
        }
    }

    Ok(())
}

/// Each image's assets go in a directory named after the image
fn asset_dir(output: &Path, rom_path: &Path) -> PathBuf {
    let stem = rom_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    output.join(stem)
}

fn write_asset_file(output_path: &Path, content: &[u8], force: bool) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;
    file.write_all(content)
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbascope_core::buffer::encode_pointer;
    use gbascope_core::lz77;
    use tempfile::TempDir;

    fn write_rom(dir: &Path, name: &str) -> PathBuf {
        let mut data = vec![0u8; 0x1000];
        data[0xAC..0xB0].copy_from_slice(b"ZTST");
        let palette: Vec<u8> = (0..32).collect();
        let packed = lz77::compress(&palette).unwrap();
        data[0x400..0x400 + packed.len()].copy_from_slice(&packed);
        data[0x200..0x204].copy_from_slice(&encode_pointer(0x400, 0x08));

        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_asset_index_skips_repeats() {
        let mut assets = AssetIndex::new();
        let out = Path::new("/out");

        let first = assets.claim(out.join("firered/palette_000400.pal"), b"JASC-PAL one");
        assert_eq!(first, Some(out.join("firered/palette_000400.pal")));

        // same bytes from another image
        assert!(assets
            .claim(out.join("leafgreen/palette_000400.pal"), b"JASC-PAL one")
            .is_none());
        // same name, different bytes
        assert!(assets
            .claim(out.join("leafgreen/palette_000800.pal"), b"JASC-PAL two")
            .is_some());

        assert_eq!(assets.found, 3);
        assert_eq!(assets.duplicates, 1);
    }

    #[test]
    fn test_asset_dir() {
        assert_eq!(
            asset_dir(Path::new("out"), Path::new("/roms/emerald.gba")),
            Path::new("out/emerald")
        );
        assert_eq!(asset_dir(Path::new("out"), Path::new("/")), Path::new("out/image"));
    }

    #[test]
    fn test_is_rom() {
        assert!(is_rom(Path::new("/tmp/firered.gba")));
        assert!(is_rom(Path::new("/tmp/EMERALD.GBA")));
        assert!(!is_rom(Path::new("/tmp/notes.txt")));
        assert!(!is_rom(Path::new("/tmp/gba")));
    }

    #[test]
    fn test_extract_palette() {
        let rom_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let rom = write_rom(rom_dir.path(), "test.gba");

        let cli = Cli::parse_from([
            "gbascope",
            "--file",
            rom.to_str().unwrap(),
            "--extract",
            "--output",
            out_dir.path().to_str().unwrap(),
        ]);
        let config = engine_config(&cli).unwrap();
        let mut assets = AssetIndex::new();
        process_rom(&cli, &config, &rom, &mut assets).unwrap();

        let written = out_dir.path().join("test/palette_000400.pal");
        let text = fs::read_to_string(written).unwrap();
        assert!(text.starts_with("JASC-PAL\n0100\n16\n"));
        assert_eq!(assets.written, 1);

        // a copy under another name carries the same palette
        let copy = write_rom(rom_dir.path(), "copy.gba");
        process_rom(&cli, &config, &copy, &mut assets).unwrap();
        assert_eq!(assets.duplicates, 1);
        assert!(!out_dir.path().join("copy").exists());
    }

    #[test]
    fn test_write_asset_file_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/image.ppm");
        write_asset_file(&path, b"P6", false).unwrap();
        assert!(write_asset_file(&path, b"P6", false).is_err());
        write_asset_file(&path, b"P6\n", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"P6\n");
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

use std::fs::File;
use std::path::PathBuf;

use anyhow::*;
use camino::{Utf8Path, Utf8PathBuf};
use log::*;
use memmap2::Mmap;
use structopt::*;

use defrost::{Extractor, PkgArchive};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "defrost",
    about = "Extracts the archive embedded in a PyInstaller frozen executable"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// Where to put the extracted tree (default: <EXE>_extracted)
    #[structopt(short, long)]
    output: Option<Utf8PathBuf>,

    /// Overwrite existing files in the output tree
    #[structopt(long)]
    overwrite: bool,

    /// Extract entries one at a time instead of in parallel
    #[structopt(long)]
    sequential: bool,

    #[structopt(name("frozen executable"))]
    exe_path: Utf8PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if let Some(chto) = args.directory {
        std::env::set_current_dir(&chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    let output_root = args
        .output
        .unwrap_or_else(|| Utf8PathBuf::from(format!("{}_extracted", args.exe_path)));

    extract(&args.exe_path, &output_root, args.overwrite, args.sequential)
}

fn extract(exe_path: &Utf8Path, output_root: &Utf8Path, overwrite: bool, sequential: bool) -> Result<()> {
    info!("Memory mapping {:#?}", exe_path);
    let exe = File::open(exe_path).context("Couldn't open executable")?;
    let mapping = unsafe { Mmap::map(&exe).context("Couldn't mmap executable")? };

    let archive = PkgArchive::new(&mapping).context("Couldn't load archive")?;
    info!(
        "Found a Python {} archive with {} entries",
        archive.python_version(),
        archive.entries().len()
    );

    let report = Extractor::new()
        .overwrite(overwrite)
        .parallel(!sequential)
        .run(&archive, output_root)
        .context("Extraction failed")?;

    for failure in &report.failed {
        warn!("{}: {}", failure.name, failure.error);
    }
    println!(
        "{}: {} files extracted to {output_root}, {} failed",
        exe_path,
        report.succeeded,
        report.failed.len()
    );
    if report.succeeded == 0 && !report.failed.is_empty() {
        bail!("Nothing could be extracted");
    }
    Ok(())
}

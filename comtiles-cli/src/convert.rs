//! `convert` subcommand: the `comtiles-convert` producer front-end
//! (spec.md §6).

use std::fs::File;
use std::path::PathBuf;

use bytesize::ByteSize;
use clap::Parser;
use comtiles::ArchiveWriter;

use crate::dir_source::DirTileSource;

#[derive(Parser, Debug)]
#[command(about = "Build a COMTiles archive from a tile directory tree")]
pub struct Args {
    /// Source of tiles to pack. Since the MBTiles reader is out of scope
    /// here, this is a `{z}/{x}/{y}.pbf[.gz]` directory tree rather than an
    /// `.mbtiles` file.
    #[arg(short = 'i', long = "input", value_name = "PATH")]
    input: PathBuf,

    /// Destination `.comt` archive path.
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: PathBuf,

    /// Highest zoom kept in the always-resident pyramid index; zooms above
    /// this are written as fragmented, lazily-fetched zooms.
    #[arg(short = 'z', long = "pyramidMaxZoom", default_value_t = 7)]
    pyramid_max_zoom: u8,

    /// Accepted for CLI-contract parity with spec.md §6. An MBTiles-backed
    /// producer would use this to cap how many rows it queries from the
    /// source database per batch; the directory-tree source here has no
    /// database query step, so the value is parsed and otherwise unused.
    #[arg(short = 'm', long = "maxZoomDbQuery", default_value_t = 8)]
    max_zoom_db_query: u8,
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let _ = args.max_zoom_db_query;

    log::info!(
        "discovering tiles under {} (pyramidMaxZoom={})",
        args.input.display(),
        args.pyramid_max_zoom
    );
    let source = DirTileSource::discover(&args.input, args.pyramid_max_zoom)?;

    let out = File::create(&args.output)?;
    let writer = ArchiveWriter::create(out, source.metadata().clone())?;
    let stats = writer.write_all_tiles(&source)?;

    println!(
        "wrote {} to {} ({} tiles, {} padding entries)",
        ByteSize::b(stats.bytes_written),
        args.output.display(),
        stats.tiles_written,
        stats.padding_entries
    );

    Ok(())
}

//! `show` subcommand
//!
//! Inspect a local or remote COMTiles archive: header, validated metadata,
//! and a per-zoom summary of pyramid vs. fragmented coverage.

use clap::Parser;
use comtiles::{ArchiveReader, HttpBackend, MmapBackend};
use reqwest::Client;

#[derive(Parser, Debug)]
#[command(about = "Inspect a local or remote COMTiles archive")]
pub struct Args {
    /// Path to a `.comt` archive (local file or HTTP URL)
    #[arg(value_name = "PATH")]
    path: String,
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.path.starts_with("http://") || args.path.starts_with("https://") {
        let client = Client::builder()
            .user_agent(format!("comtiles-cli/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let backend = HttpBackend::try_new(client, args.path.as_str())?;
        let reader = ArchiveReader::open(backend).await?;
        print_archive_info(&reader);
    } else {
        let backend = MmapBackend::try_new(&args.path).await?;
        let reader = ArchiveReader::open(backend).await?;
        print_archive_info(&reader);
    }

    Ok(())
}

fn print_archive_info<B: comtiles::RangeSource + 'static>(reader: &ArchiveReader<B>) {
    let header = reader.header();
    let metadata = reader.metadata();

    println!("comtiles version: {}", header.version);
    println!("metadata length: {} bytes", header.meta_len);
    println!("pyramid index length: {} bytes (compressed)", header.pyramid_len);
    println!("fragment index length: {} bytes", header.fragment_len);
    println!("data section offset: {}", header.data_offset());

    println!("tile matrix CRS: {:?}", metadata.tile_matrix_crs);
    println!("tile format: {}", metadata.tile_format);
    println!(
        "pyramid max zoom: {}",
        metadata
            .pyramid_max_zoom()
            .map_or_else(|| "none".to_string(), |z| z.to_string())
    );
    println!("zoom levels: {}", metadata.tile_matrix_set.len());

    for tm in &metadata.tile_matrix_set {
        let limits = &tm.tile_matrix_limits;
        let kind = if tm.is_pyramid() {
            "pyramid".to_string()
        } else {
            format!("fragmented (F={})", tm.fragment_side())
        };
        println!(
            "  z{}: {kind}, cols {}..={}, rows {}..={} ({} tiles)",
            tm.zoom,
            limits.min_tile_col,
            limits.max_tile_col,
            limits.min_tile_row,
            limits.max_tile_row,
            tm.num_tiles()
        );
    }
}

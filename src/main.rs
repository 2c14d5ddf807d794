// ========================================================================================
//
//                               The orchestrator: verdant
//
// ========================================================================================
//
// Command-line front end for the retrieval engine. It owns process-level
// resources (logger, rayon pool), loads the model store, shapes a pixel table
// into a raster, and hands everything to the pipeline. It contains no numeric
// logic of its own.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::Parser;
use ndarray::{Array2, Array3};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Once;
use verdant::model::ModelStore;
use verdant::pipeline::{self, EvaluationRequest};
use verdant::types::{SpectralRaster, TraitKind, TraitRaster};

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "verdant",
    version,
    about = "Retrieves biophysical plant traits from multispectral reflectance spectra."
)]
struct Args {
    /// CSV of pixel spectra: header row lists band names, one pixel per row.
    /// An empty field anywhere in a row marks that pixel as masked/no-data.
    #[clap(value_name = "PIXELS_CSV")]
    pixels: PathBuf,

    /// Directory containing trait model TOML files.
    #[clap(long, value_name = "DIR")]
    models: PathBuf,

    /// Trait to retrieve.
    #[clap(long = "trait", value_enum, value_name = "TRAIT")]
    trait_kind: TraitKind,

    /// Output CSV path for the retrieved trait column.
    #[clap(short, long, value_name = "OUT_CSV")]
    output: PathBuf,

    /// Strip height (rows) for tiled evaluation. Derived from the input size
    /// and core count if not given.
    #[clap(long)]
    tile_rows: Option<usize>,
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

static RAYON_INIT: Once = Once::new();

fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    RAYON_INIT.call_once(|| {
        rayon::ThreadPoolBuilder::new()
            .build_global()
            .expect("failed to initialize Rayon global thread pool");
    });

    let store = ModelStore::load_dir(&args.models)?;
    log::info!(
        "Model store ready: {} model(s), {} worker thread(s)",
        store.len(),
        num_cpus::get()
    );

    let raster = read_pixel_table(&args.pixels)?;
    let mut request = EvaluationRequest::new(args.trait_kind);
    request.tile_rows = args.tile_rows;
    request.show_progress = true;

    let output = pipeline::run(&store, &raster, &request)?;
    write_trait_column(&args.output, &output)?;

    match output.value_range() {
        Some((lo, hi)) => println!(
            "{} ({}): min={lo:.6} max={hi:.6}",
            args.trait_kind.title(),
            args.trait_kind.unit()
        ),
        None => println!(
            "{}: no valid pixels in input",
            args.trait_kind.title()
        ),
    }
    Ok(())
}

/// Reads the pixel CSV as an Hx1 raster: header = band order, each data row
/// one pixel, empty fields marking masked pixels.
fn read_pixel_table(path: &Path) -> Result<SpectralRaster, Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let band_order: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let num_bands = band_order.len();

    let mut spectra: Vec<Vec<f64>> = Vec::new();
    let mut valid: Vec<bool> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != num_bands {
            return Err(format!(
                "Row {} has {} fields, expected {} (one per band).",
                line + 2,
                record.len(),
                num_bands
            )
            .into());
        }
        let masked = record.iter().any(|field| field.trim().is_empty());
        if masked {
            spectra.push(vec![0.0; num_bands]);
            valid.push(false);
            continue;
        }
        let values = record
            .iter()
            .map(|field| {
                field.trim().parse::<f64>().map_err(|_| {
                    format!("Row {}: '{}' is not a number.", line + 2, field.trim())
                })
            })
            .collect::<Result<Vec<f64>, String>>()?;
        spectra.push(values);
        valid.push(true);
    }

    let rows = spectra.len();
    let mut bands = Array3::zeros((num_bands, rows, 1));
    for (r, pixel) in spectra.iter().enumerate() {
        for (b, &value) in pixel.iter().enumerate() {
            bands[[b, r, 0]] = value;
        }
    }
    let mask = Array2::from_shape_fn((rows, 1), |(r, _)| valid[r]);

    Ok(SpectralRaster::new(bands, band_order, mask)?)
}

/// Writes the trait raster as a single CSV column, empty fields for no-data.
fn write_trait_column(path: &Path, raster: &TraitRaster) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([raster.output_name.as_str()])?;
    for (&value, &is_valid) in raster.values.iter().zip(raster.mask.iter()) {
        if is_valid {
            writer.write_record([format!("{value}")])?;
        } else {
            writer.write_record([""])?;
        }
    }
    writer.flush()?;
    Ok(())
}

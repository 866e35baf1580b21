use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use image::{ImageBuffer, Luma};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use starstack::catalog::{load_catalog, save_catalog};
use starstack::mosaic::Mosaic;
use starstack::raster::Raster;
use starstack::resample::Canvas;
use starstack::stack_pool::{CombineMethod, StackPool};
use starstack::stacker::{Exposure, ExposureSource, StackParameters, StackSink};
use starstack::warper::{FitParameters, Warper};

/// Command line arguments structure.
#[derive(Parser, Debug)]
#[command(name = "starstack")]
#[command(author, version, about = "Registers and stacks astronomical exposures from their star catalogs.")]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit the warp that maps one catalog onto a reference catalog
    Fit {
        /// Reference catalog ("x y flux" per line)
        #[arg(long)]
        reference: PathBuf,

        /// Polynomial order of the warp (2 is affine)
        #[arg(long, default_value_t = 3)]
        order: usize,

        /// Match radius of the final match list
        #[arg(long, default_value_t = 2.5)]
        match_radius: f64,

        /// Matches further than this many standard deviations are dropped
        #[arg(long, default_value_t = 3.0)]
        clipping_sigma: f64,

        /// Catalog to register
        catalog: PathBuf,
    },
    /// Register exposures by their catalogs and stack their images
    Mosaic {
        /// Output image (16-bit grayscale)
        #[arg(long)]
        out: PathBuf,

        /// Reference catalog; defaults to the first input catalog
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Polynomial order of the warps
        #[arg(long, default_value_t = 3)]
        order: usize,

        /// How overlapping exposures are combined: sum, mean, median, min or max
        #[arg(long, default_value = "sum")]
        combine: CombineMethod,

        /// Exposure time of each image, in input order; a single value applies to all
        #[arg(long)]
        exposure_time: Vec<f64>,

        /// Optionally write the merged catalog
        #[arg(long)]
        merged_catalog: Option<PathBuf>,

        /// Optionally write the stacked values as "x y value" text
        #[arg(long)]
        output_values: Option<PathBuf>,

        /// The catalogs followed by the images, in the same order
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
    },
    /// Combine equally sized images pixel by pixel, without registration
    Combine {
        /// Output image (16-bit grayscale)
        #[arg(long)]
        out: PathBuf,

        /// How the images are combined: sum, mean, median, min or max
        #[arg(long, default_value = "mean")]
        combine: CombineMethod,

        /// Input images
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

/// An image file and the exposure time its samples are scaled by.
#[derive(Debug, Clone)]
struct ImageHandle {
    path: PathBuf,
    exposure_time: f64,
}

/// Loads exposures from image files as 32-bit float luminance.
struct ImageFiles;

impl ExposureSource<ImageHandle> for ImageFiles {
    fn dimensions(&self, handle: &ImageHandle) -> starstack::Result<(usize, usize)> {
        let (width, height) = image::image_dimensions(&handle.path).map_err(|e| load_error(&handle.path, e))?;
        Ok((width as usize, height as usize))
    }

    fn load(&self, handle: &ImageHandle) -> starstack::Result<Exposure> {
        info!("Reading image file: {}", handle.path.display());
        Ok(Exposure {
            pixels: read_raster(&handle.path)?,
            exposure_time: handle.exposure_time,
        })
    }
}

/// Writes rasters as 16-bit grayscale images.
struct ImageSink;

impl StackSink<PathBuf> for ImageSink {
    fn write(&self, destination: &PathBuf, raster: &Raster) -> starstack::Result<()> {
        save_raster(raster, destination)
    }
}

fn load_error(path: &Path, error: impl std::fmt::Display) -> starstack::Error {
    starstack::Error::Load {
        handle: path.display().to_string(),
        reason: error.to_string(),
    }
}

fn read_raster(path: &Path) -> starstack::Result<Raster> {
    let img = image::open(path).map_err(|e| load_error(path, e))?;
    let luma = img.to_luma32f();
    let (width, height) = luma.dimensions();
    Raster::from_vec(width as usize, height as usize, luma.into_raw())
}

/// Linear stretch of the finite range onto `0..=u16::MAX`; `NaN` becomes black.
fn save_raster(raster: &Raster, path: &Path) -> starstack::Result<()> {
    info!("Writing image {}", path.display());
    let (lo, hi) = raster.finite_range().unwrap_or((0.0, 1.0));
    let span = if hi > lo { hi - lo } else { 1.0 };
    let pixels: Vec<u16> = raster
        .data
        .iter()
        .map(|&v| {
            if v.is_finite() {
                (((v - lo) / span) * u16::MAX as f32).round() as u16
            } else {
                0
            }
        })
        .collect();
    let img: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(raster.width as u32, raster.height as u32, pixels)
            .ok_or_else(|| load_error(path, "raster size does not match its samples"))?;
    img.save(path).map_err(|e| load_error(path, e))
}

fn to_value_list(raster: &Raster, canvas: &Canvas) -> String {
    let mut out = String::with_capacity(raster.data.len() * 16);
    for y in 0..raster.height {
        for x in 0..raster.width {
            let v = raster.get(x, y);
            if v.is_nan() {
                continue;
            }
            let [cx, cy] = canvas.position(x, y);
            out.push_str(&format!("{} {} {:.6}\n", cx, cy, v));
        }
    }
    out
}

fn print_surfaces(warper: &Warper) {
    println!("{:>3} {:>3} {:>16} {:>16}", "p", "q", "fx", "fy");
    let n = warper.order();
    for p in 0..n {
        for q in 0..n - p {
            println!(
                "{:>3} {:>3} {:>16.9e} {:>16.9e}",
                p,
                q,
                warper.fx().coefficient(p, q),
                warper.fy().coefficient(p, q)
            );
        }
    }
}

fn run_fit(reference: &Path, catalog: &Path, order: usize, match_radius: f64, clipping_sigma: f64) -> Result<()> {
    let reference = load_catalog(reference).with_context(|| format!("Failed to read {}", reference.display()))?;
    let source = load_catalog(catalog).with_context(|| format!("Failed to read {}", catalog.display()))?;

    let parameters = FitParameters {
        fine_match_radius: match_radius,
        clipping_sigma,
        ..FitParameters::default()
    };
    let mut warper = Warper::identity(order)?;
    let matches = warper
        .fit_with(&reference, &source, &parameters)
        .context("Failed to fit warp")?;

    let rms = (matches
        .iter()
        .map(|m| {
            let [dx, dy] = m.residual(&warper);
            dx * dx + dy * dy
        })
        .sum::<f64>()
        / matches.len().max(1) as f64)
        .sqrt();
    println!("{} matches, rms residual {:.4}", matches.len(), rms);
    print_surfaces(&warper);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_mosaic(
    out: &Path,
    reference: Option<&Path>,
    order: usize,
    combine: CombineMethod,
    exposure_times: &[f64],
    merged_catalog: Option<&Path>,
    output_values: Option<&Path>,
    inputs: &[PathBuf],
) -> Result<()> {
    ensure!(
        inputs.len() % 2 == 0,
        "expected as many catalogs as images, got {} inputs",
        inputs.len()
    );
    let (catalogs, images) = inputs.split_at(inputs.len() / 2);
    let exposure_time = |i: usize| match exposure_times {
        [] => Ok(1.0),
        [t] => Ok(*t),
        times if times.len() == images.len() => Ok(times[i]),
        times => bail!("got {} exposure times for {} images", times.len(), images.len()),
    };

    let reference_path = reference.unwrap_or(catalogs[0].as_path());
    let reference = load_catalog(reference_path)
        .with_context(|| format!("Failed to read {}", reference_path.display()))?;

    let parameters = StackParameters {
        combine,
        ..StackParameters::default()
    };
    let mut mosaic = Mosaic::new(reference, order, parameters)?;
    for (i, (catalog_path, image_path)) in catalogs.iter().zip(images).enumerate() {
        let catalog = load_catalog(catalog_path)
            .with_context(|| format!("Failed to read {}", catalog_path.display()))?;
        let handle = ImageHandle {
            path: image_path.clone(),
            exposure_time: exposure_time(i)?,
        };
        mosaic
            .add(&catalog, handle)
            .with_context(|| format!("Failed to register {}", catalog_path.display()))?;
    }

    if let Some(path) = merged_catalog {
        save_catalog(path, mosaic.merged_catalog())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Merged catalog written to {}", path.display());
    }

    let stacker = mosaic.into_stacker();
    let result = stacker.combine(&ImageFiles).context("Failed to stack exposures")?;
    ImageSink
        .write(&out.to_path_buf(), &result.raster)
        .context("Failed to write output")?;

    if let Some(path) = output_values {
        let mut file = BufWriter::new(File::create(path).context("Could not create values output file")?);
        file.write_all(to_value_list(&result.raster, &result.canvas).as_bytes())
            .context("Failed to write values")?;
        info!("Values written to {}", path.display());
    }
    Ok(())
}

fn run_combine(out: &Path, combine: CombineMethod, images: &[PathBuf]) -> Result<()> {
    let first = read_raster(&images[0]).with_context(|| format!("Failed to read {}", images[0].display()))?;
    let (width, height) = first.dimensions();
    let mut pool = StackPool::new(width, height, images.len());
    pool.paste(0, &first)?;
    for (z, path) in images.iter().enumerate().skip(1) {
        let raster = read_raster(path).with_context(|| format!("Failed to read {}", path.display()))?;
        pool.paste(z, &raster)
            .with_context(|| format!("Image {} does not match the first image", path.display()))?;
    }
    save_raster(&pool.reduce(combine), out).context("Failed to write output")?;
    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let start = Instant::now();

    match cli.command {
        Commands::Fit {
            reference,
            order,
            match_radius,
            clipping_sigma,
            catalog,
        } => run_fit(&reference, &catalog, order, match_radius, clipping_sigma)?,
        Commands::Mosaic {
            out,
            reference,
            order,
            combine,
            exposure_time,
            merged_catalog,
            output_values,
            inputs,
        } => {
            run_mosaic(
                &out,
                reference.as_deref(),
                order,
                combine,
                &exposure_time,
                merged_catalog.as_deref(),
                output_values.as_deref(),
                &inputs,
            )?;
            println!("Stack saved to: {}", out.display());
        }
        Commands::Combine { out, combine, images } => {
            run_combine(&out, combine, &images)?;
            println!("Combined image saved to: {}", out.display());
        }
    }

    info!("Done in {:.2?}", start.elapsed());
    Ok(())
}

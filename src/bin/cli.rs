//! Command line front end for cascade detection and distance transforms.
//!
//! Usage:
//!   lbp-cascade detect <image> --cascade face.json.bz2     # Human-readable output
//!   lbp-cascade detect <image> --cascade face.bin --json   # JSON output
//!   lbp-cascade distance <mask> --metric euclidean -o d.png
//!   lbp-cascade convert face.json.bz2 face.bin             # Flatten and save
//!   lbp-cascade inspect face.bin

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use image::GenericImageView;
use lbp_cascade::distance::{distance_transform, DistanceMetric, DistanceParams, MaskSize, INIT_DIST};
use lbp_cascade::{
    CascadeClassifier, Detection, DetectorParams, Error, FlattenedModel, GrayImage, Size,
};
use log::{info, warn};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "lbp-cascade")]
#[command(author, version, about = "LBP cascade detection and distance transforms", long_about = None)]
struct Args {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect objects in an image
    Detect {
        /// Input image file
        image: PathBuf,

        /// Cascade file (.json, .json.bz2 or flattened .bin)
        #[arg(long)]
        cascade: PathBuf,

        /// JSON file with detector parameters
        #[arg(long)]
        params: Option<PathBuf>,

        /// Pyramid scale factor
        #[arg(long)]
        scale_factor: Option<f32>,

        /// Minimum neighbors per detection (0 disables grouping)
        #[arg(long)]
        group_threshold: Option<i32>,

        /// Largest object size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_size)]
        max_size: Option<Size>,

        /// Report only the largest object
        #[arg(long)]
        largest: bool,

        /// Scan threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Candidate buffer capacity (default: half the image width)
        #[arg(long)]
        capacity: Option<usize>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Distance transform of a binary mask (zero pixels are the seeds)
    Distance {
        /// Input mask image
        mask: PathBuf,

        #[arg(long, value_enum, default_value_t = MetricArg::Euclidean)]
        metric: MetricArg,

        /// Mask aperture, 3 or 5
        #[arg(long, default_value = "3")]
        aperture: u32,

        /// Also compute nearest-region labels (needs aperture 5)
        #[arg(long)]
        labels: bool,

        /// Write the normalised distance map as an 8-bit image
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output statistics as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Flatten a cascade description and save it as bincode
    Convert { input: PathBuf, output: PathBuf },

    /// Print cascade statistics
    Inspect {
        model: PathBuf,

        #[arg(short, long)]
        json: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MetricArg {
    Chebyshev,
    Manhattan,
    Euclidean,
}

impl From<MetricArg> for DistanceMetric {
    fn from(metric: MetricArg) -> Self {
        match metric {
            MetricArg::Chebyshev => DistanceMetric::Chebyshev,
            MetricArg::Manhattan => DistanceMetric::Manhattan,
            MetricArg::Euclidean => DistanceMetric::Euclidean,
        }
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let w = w.trim().parse().map_err(|e| format!("bad width: {}", e))?;
    let h = h.trim().parse().map_err(|e| format!("bad height: {}", e))?;
    Ok(Size::new(w, h))
}

/// Output structure for JSON serialization
#[derive(Serialize)]
struct DetectOutput {
    image: String,
    width: u32,
    height: u32,
    objects_detected: usize,
    objects: Vec<ObjectOutput>,
}

#[derive(Serialize)]
struct ObjectOutput {
    /// Object index (1-based)
    index: usize,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    /// Candidates merged into this object
    neighbors: usize,
}

#[derive(Serialize)]
struct DistanceOutputStats {
    mask: String,
    width: u32,
    height: u32,
    seeds: usize,
    max_distance: f32,
    mean_distance: f32,
    regions: Option<usize>,
}

#[derive(Serialize)]
struct ModelInfo {
    window_width: i32,
    window_height: i32,
    stages: usize,
    stumps: usize,
    features: usize,
    categories: usize,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &args.command {
        Command::Detect {
            image,
            cascade,
            params,
            scale_factor,
            group_threshold,
            max_size,
            largest,
            threads,
            capacity,
            json,
            output,
        } => {
            let mut detector_params = match params {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => DetectorParams::default(),
            };
            if let Some(v) = scale_factor {
                detector_params.scale_factor = *v;
            }
            if let Some(v) = group_threshold {
                detector_params.group_threshold = *v;
            }
            if max_size.is_some() {
                detector_params.max_object_size = *max_size;
            }
            if *largest {
                detector_params.find_largest_object = true;
            }
            if threads.is_some() {
                detector_params.num_threads = *threads;
            }
            if capacity.is_some() {
                detector_params.candidate_capacity = *capacity;
            }
            detect(image, cascade, &detector_params, *json, output.as_deref())
        }
        Command::Distance {
            mask,
            metric,
            aperture,
            labels,
            output,
            json,
        } => {
            let params = DistanceParams {
                metric: (*metric).into(),
                mask_size: MaskSize::from_aperture(*aperture)?,
                labels: *labels,
            };
            distance(mask, &params, output.as_deref(), *json)
        }
        Command::Convert { input, output } => {
            let model = load_model(input)?;
            model.save(output)?;
            info!("flattened model written to {:?}", output);
            Ok(())
        }
        Command::Inspect { model, json } => {
            let model = load_model(model)?;
            let info = ModelInfo {
                window_width: model.window_size().width,
                window_height: model.window_size().height,
                stages: model.num_stages(),
                stumps: model.num_trees(),
                features: model.features().len(),
                categories: model.category_count(),
            };
            if *json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Window:     {}x{}", info.window_width, info.window_height);
                println!("Stages:     {}", info.stages);
                println!("Stumps:     {}", info.stumps);
                println!("Features:   {}", info.features);
                println!("Categories: {}", info.categories);
            }
            Ok(())
        }
    }
}

fn load_model(path: &Path) -> Result<FlattenedModel, Box<dyn std::error::Error>> {
    let classifier = CascadeClassifier::from_file(path)?;
    classifier
        .model()
        .cloned()
        .ok_or_else(|| "cascade did not load".into())
}

fn load_gray(path: &Path) -> Result<GrayImage, Box<dyn std::error::Error>> {
    let img = image::open(path)?;
    let (width, height) = img.dimensions();
    Ok(GrayImage::new(img.to_luma8().into_raw(), width, height)?)
}

fn detect(
    image_path: &Path,
    cascade: &Path,
    params: &DetectorParams,
    json: bool,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("loading cascade from {:?}", cascade);
    let mut classifier = CascadeClassifier::from_file(cascade)?;

    info!("loading image {:?}", image_path);
    let gray = load_gray(image_path)?;

    let detections = detect_with_retry(&mut classifier, &gray, params)?;
    info!("found {} object(s)", detections.len());

    let result = DetectOutput {
        image: image_path.display().to_string(),
        width: gray.width(),
        height: gray.height(),
        objects_detected: detections.len(),
        objects: detections
            .iter()
            .enumerate()
            .map(|(i, d)| ObjectOutput {
                index: i + 1,
                x: d.rect.x,
                y: d.rect.y,
                width: d.rect.width,
                height: d.rect.height,
                neighbors: d.neighbors,
            })
            .collect(),
    };

    let output_str = if json {
        serde_json::to_string_pretty(&result)?
    } else {
        format_detections(&result)
    };

    if let Some(path) = output {
        std::fs::write(path, &output_str)?;
        info!("output written to {:?}", path);
    } else {
        println!("{}", output_str);
    }
    Ok(())
}

/// Run detection, retrying once with the reported candidate count when the
/// buffer overflows.
fn detect_with_retry(
    classifier: &mut CascadeClassifier,
    gray: &GrayImage,
    params: &DetectorParams,
) -> Result<Vec<Detection>, Error> {
    match classifier.detect(gray, params) {
        Err(Error::CapacityExceeded { found, capacity }) => {
            warn!(
                "{} candidates overflowed a buffer of {}, retrying",
                found, capacity
            );
            let retry = DetectorParams {
                candidate_capacity: Some(found),
                ..params.clone()
            };
            classifier.detect(gray, &retry)
        }
        other => other,
    }
}

fn format_detections(output: &DetectOutput) -> String {
    let mut s = String::new();

    s.push_str(&format!("Image: {} ({}x{})\n", output.image, output.width, output.height));
    s.push_str(&format!("Objects detected: {}\n", output.objects_detected));

    if output.objects.is_empty() {
        s.push_str("\nNo objects found.\n");
        return s;
    }

    for obj in &output.objects {
        s.push_str(&format!(
            "  #{}: {}x{} at ({}, {}), {} neighbors\n",
            obj.index, obj.width, obj.height, obj.x, obj.y, obj.neighbors
        ));
    }
    s
}

fn distance(
    mask_path: &Path,
    params: &DistanceParams,
    output: Option<&Path>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mask = load_gray(mask_path)?;
    let result = distance_transform(&mask, params)?;

    // Pixels no seed reached keep the sentinel; leave them out of the stats.
    let unreached = INIT_DIST as f32 / (1u32 << lbp_cascade::distance::DIST_SHIFT) as f32;
    let reached: Vec<f32> = result
        .distances
        .as_slice()
        .iter()
        .copied()
        .filter(|&d| d < unreached)
        .collect();
    let max_distance = reached.iter().copied().fold(0.0f32, f32::max);
    let mean_distance = if reached.is_empty() {
        0.0
    } else {
        reached.iter().sum::<f32>() / reached.len() as f32
    };

    let stats = DistanceOutputStats {
        mask: mask_path.display().to_string(),
        width: mask.width(),
        height: mask.height(),
        seeds: mask.as_slice().iter().filter(|&&p| p == 0).count(),
        max_distance,
        mean_distance,
        regions: result
            .labels
            .as_ref()
            .map(|l| l.as_slice().iter().copied().max().unwrap_or(0).max(0) as usize),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Mask: {} ({}x{})", stats.mask, stats.width, stats.height);
        println!("Seeds: {}", stats.seeds);
        println!("Max distance:  {:.3}", stats.max_distance);
        println!("Mean distance: {:.3}", stats.mean_distance);
        if let Some(regions) = stats.regions {
            println!("Regions: {}", regions);
        }
    }

    if let Some(path) = output {
        let norm = if max_distance > 0.0 { 255.0 / max_distance } else { 0.0 };
        let pixels: Vec<u8> = result
            .distances
            .as_slice()
            .iter()
            .map(|&d| if d < unreached { (d * norm).round().min(255.0) as u8 } else { 255 })
            .collect();
        let out = image::GrayImage::from_raw(mask.width(), mask.height(), pixels)
            .ok_or("distance map size mismatch")?;
        out.save(path)?;
        info!("distance map written to {:?}", path);
    }
    Ok(())
}

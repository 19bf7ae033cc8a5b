use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eventtrack::{
    BayesClassifier, Classify, DetectionParameters, FeatureCollection, FeatureRecord, FeatureType, FramePipeline, Winner,
};

#[derive(Parser)]
#[command(
    name = "eventtrack",
    about = "Detect and track visual events in a sequence of video frames",
    version
)]
struct Args {
    /// Directory of frame images, processed in file name order
    #[arg(long)]
    frames: PathBuf,

    /// JSON array of saliency winners for all frames
    #[arg(long)]
    winners: PathBuf,

    /// Detection parameters (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bayes classifier model
    #[arg(long)]
    bayes: Option<PathBuf>,

    /// JSON array of feature records (event, frame, values) for the classifier
    #[arg(long)]
    features: Option<PathBuf>,

    /// Feature type the classifier was trained on
    #[arg(long, default_value = "hog")]
    feature_type: String,

    /// Where to write the event set
    #[arg(long, default_value = "events.jsonl")]
    output: PathBuf,

    /// Optional text file of per-frame event positions
    #[arg(long)]
    positions: Option<PathBuf>,
}

fn list_frames(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading frame directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "ppm" | "bmp"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn load_winners(path: &Path) -> anyhow::Result<BTreeMap<u32, Vec<Winner>>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening winners {:?}", path))?);
    let winners: Vec<Winner> = serde_json::from_reader(reader).context("parsing winners")?;
    let mut by_frame: BTreeMap<u32, Vec<Winner>> = BTreeMap::new();
    for w in winners {
        by_frame.entry(w.frame_num).or_default().push(w);
    }
    Ok(by_frame)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let params = match &args.config {
        Some(path) => DetectionParameters::from_file(path)?,
        None => DetectionParameters::default(),
    };
    let params = Arc::new(params);
    info!("Tracking mode {:?}", params.tracking_mode);

    let classifier = match &args.bayes {
        Some(path) => {
            let feature_type: FeatureType = args.feature_type.parse()?;
            match BayesClassifier::load(path, feature_type) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("Could not load classifier {:?}: {}; continuing unclassified", path, e);
                    None
                }
            }
        }
        None => None,
    };

    let features = match &args.features {
        Some(path) => {
            let reader = BufReader::new(File::open(path).with_context(|| format!("opening features {:?}", path))?);
            let records: Vec<FeatureRecord> = serde_json::from_reader(reader).context("parsing features")?;
            Some(FeatureCollection::from_records(records))
        }
        None => None,
    };

    let frames = list_frames(&args.frames)?;
    if frames.is_empty() {
        anyhow::bail!("no frame images found in {:?}", args.frames);
    }
    let winners = load_winners(&args.winners)?;
    let last_frame = frames.len() as u32 - 1;
    info!("Processing {} frame(s) with {} winner frame(s)", frames.len(), winners.len());

    let file_name = args.frames.to_string_lossy().to_string();
    let mut pipeline = FramePipeline::new(Arc::clone(&params), &file_name, Some(last_frame))?;

    let mut priming = Vec::new();
    for path in frames.iter().take(params.cache_size.max(1)) {
        priming.push(image::open(path)?.to_rgb8());
    }
    pipeline.prime(priming, 0)?;

    for (frame_num, path) in frames.iter().enumerate() {
        let frame_num = frame_num as u32;
        let frame = image::open(path)
            .with_context(|| format!("reading frame {:?}", path))?
            .to_rgb8();
        let frame_winners = winners.get(&frame_num).map(Vec::as_slice).unwrap_or(&[]);
        let result = pipeline.process(
            frame_num,
            &frame,
            frame_winners,
            classifier.as_ref().map(|c| c as &dyn Classify),
            features.as_ref(),
        )?;
        info!(
            "Frame {}: {} detection(s), {} new event(s)",
            result.frame_num,
            result.detections.len(),
            result.summary.created.len()
        );
    }
    pipeline.finish();

    let events = pipeline.events();
    let mut out = BufWriter::new(File::create(&args.output)?);
    events.write_to_stream(&mut out)?;
    out.flush()?;
    info!("Wrote {} event(s) to {:?}", events.num_events(), args.output);

    if let Some(path) = &args.positions {
        let mut out = BufWriter::new(File::create(path)?);
        events.write_positions(&mut out)?;
        out.flush()?;
    }
    Ok(())
}

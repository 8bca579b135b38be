use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::RgbImage;
use kinface_core::batch::{self, BatchMode};
use kinface_core::provider::default_model_dir;
use kinface_core::{
    compare, EmbeddingProvider, FaceRecord, FamilyAnalyzer, JitterMode, ModelPaths, OnnxFaceProvider,
    ParentSelector,
};
use kinface_img::{crop_face_region, load_file, DEFAULT_CROP_PADDING};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kinface", about = "KinFace face and family similarity CLI")]
struct Cli {
    /// Directory holding the ONNX model pack
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Model pack name
    #[arg(long, global = true, default_value = "buffalo_l")]
    model_name: String,
    /// ONNX Runtime intra-op threads
    #[arg(long, global = true, default_value_t = 2)]
    threads: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and print boxes, landmarks and attributes
    Detect {
        image: PathBuf,
        /// Write a padded crop of every face into this directory
        #[arg(long)]
        crop_dir: Option<PathBuf>,
    },
    /// Compare the first face of SOURCE against every face of TARGET
    Compare {
        source: PathBuf,
        target: PathBuf,
        #[arg(long, default_value_t = 0.01)]
        threshold: f32,
    },
    /// Family similarity between a parent and a child photo
    Family {
        parent: PathBuf,
        child: PathBuf,
        #[arg(long)]
        parent_age: Option<u32>,
        #[arg(long)]
        child_age: Option<u32>,
        /// Use unseeded jitter for landmark-free estimates
        #[arg(long)]
        random_jitter: bool,
    },
    /// Rank candidate parents for a child
    Parent {
        child: PathBuf,
        #[arg(required = true, num_args = 2..=10)]
        parents: Vec<PathBuf>,
        #[arg(long)]
        child_age: Option<u32>,
        /// Rank by plain cosine similarity instead of family analysis
        #[arg(long)]
        basic: bool,
    },
    /// Similarity matrix, best matches or groups over several photos
    Batch {
        #[arg(required = true, num_args = 2..)]
        images: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = Mode::SimilarityMatrix)]
        mode: Mode,
        #[arg(long, default_value_t = 0.6)]
        threshold: f32,
    },
}

/// Batch analysis kinds, spelled as in the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Mode {
    SimilarityMatrix,
    FindBestMatch,
    GroupSimilar,
}

impl From<Mode> for BatchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::SimilarityMatrix => BatchMode::SimilarityMatrix,
            Mode::FindBestMatch => BatchMode::FindBestMatch,
            Mode::GroupSimilar => BatchMode::GroupSimilar,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli.model_dir.clone().unwrap_or_else(default_model_dir);
    let paths = ModelPaths::in_dir(&model_dir, &cli.model_name);
    let mut provider = OnnxFaceProvider::load(&paths, &cli.model_name, cli.threads)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
    tracing::debug!(attributes = provider.has_attributes(), "models loaded");

    match cli.command {
        Commands::Detect { image, crop_dir } => {
            let img = open(&image)?;
            let faces = provider.detect(&img)?;
            if let Some(dir) = crop_dir {
                write_crops(&img, &faces, &dir)?;
            }
            print_json(&faces)?;
        }
        Commands::Compare { source, target, threshold } => {
            let source_faces = provider.detect(&open(&source)?)?;
            let target_faces = provider.detect(&open(&target)?)?;
            print_json(&compare(&source_faces, &target_faces, threshold)?)?;
        }
        Commands::Family {
            parent,
            child,
            parent_age,
            child_age,
            random_jitter,
        } => {
            let parent_face = first_face(&mut provider, &parent)?;
            let child_face = first_face(&mut provider, &child)?;
            let jitter = if random_jitter { JitterMode::Random } else { JitterMode::Seeded };
            let analyzer = FamilyAnalyzer::new(Default::default(), jitter);
            let result = analyzer.calculate_family_similarity(
                &parent_face,
                &child_face,
                parent_age.or(parent_face.age),
                child_age.or(child_face.age),
            )?;
            print_json(&result)?;
        }
        Commands::Parent {
            child,
            parents,
            child_age,
            basic,
        } => {
            let child_img = open(&child)?;
            let parent_imgs = parents.iter().map(|p| open(p)).collect::<Result<Vec<_>>>()?;
            let analyzer = FamilyAnalyzer::default();
            let result = ParentSelector::new(&analyzer).find_most_similar_parent(
                &mut provider,
                &child_img,
                &parent_imgs,
                child_age,
                !basic,
            );
            print_json(&result)?;
        }
        Commands::Batch { images, mode, threshold } => {
            let mut entries = Vec::with_capacity(images.len());
            for path in &images {
                match provider.detect(&open(path)?).map(|faces| faces.into_iter().next()) {
                    Ok(Some(face)) => entries.push((path.display().to_string(), face.embedding.values)),
                    Ok(None) => tracing::warn!(path = %path.display(), "no face detected, skipping"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "detection failed, skipping"),
                }
            }
            print_json(&batch::analyze(mode.into(), &entries, threshold)?)?;
        }
    }

    Ok(())
}

fn open(path: &Path) -> Result<RgbImage> {
    load_file(path).with_context(|| format!("cannot read image {}", path.display()))
}

fn first_face(provider: &mut OnnxFaceProvider, path: &Path) -> Result<FaceRecord> {
    match provider.detect(&open(path)?)?.into_iter().next() {
        Some(face) => Ok(face),
        None => bail!("no face detected in {}", path.display()),
    }
}

fn write_crops(image: &RgbImage, faces: &[FaceRecord], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    for (i, face) in faces.iter().enumerate() {
        let Some(crop) = crop_face_region(image, &face.bounding_box, DEFAULT_CROP_PADDING) else {
            tracing::warn!(face = i, "face box lies outside the image, no crop written");
            continue;
        };
        let path = dir.join(format!("face_{i}.png"));
        crop.save(&path).with_context(|| format!("cannot write {}", path.display()))?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

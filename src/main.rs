//! Janus - MPO stereo pair tool
//!
//! Lists, splits and decodes the sub-images of Multi-Picture-Object files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humansize::{BINARY, format_size};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use janus::{
    ByteSource, DecodeBudget, DecodedImage, Eye, PipelineError, PipelineStage, ScanConfig,
    StereoAssignment, StereoPair, StereoSlot, classify, extract_sub_images, open_source,
    scan_offsets, spawn_load,
};

#[derive(Parser, Debug)]
#[command(name = "janus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON scan config (chunk size and signatures)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured chunk size
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List sub-image offsets and the stereo assignment
    Scan {
        file: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Decode both eyes within a size budget
    Load {
        file: PathBuf,

        #[arg(long, default_value_t = 1920)]
        max_width: u32,

        #[arg(long, default_value_t = 1080)]
        max_height: u32,

        /// Writes left.png and right.png here
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Split every sub-image into its own JPEG file
    Extract {
        file: PathBuf,

        #[arg(short, long, default_value = "./mpo")]
        output: PathBuf,

        #[arg(long, default_value = "mpofile")]
        stem: String,
    },
}

#[derive(Serialize)]
struct ScanReport<'a> {
    file: &'a str,
    size: Option<u64>,
    offsets: &'a [u64],
    assignment: Option<StereoAssignment>,
    error: Option<String>,
}

#[derive(Serialize)]
struct EyeReport {
    eye: Eye,
    offset: u64,
    original: (u32, u32),
    decoded: (u32, u32),
    downscale: u32,
}

impl EyeReport {
    fn new(eye: Eye, image: &DecodedImage) -> Self {
        Self {
            eye,
            offset: image.offset(),
            original: image.original_dimensions(),
            decoded: (image.width(), image.height()),
            downscale: image.downscale(),
        }
    }
}

#[derive(Serialize)]
struct LoadReport {
    file: String,
    stage: PipelineStage,
    assignment: Option<StereoAssignment>,
    eyes: Vec<EyeReport>,
    failed_eye: Option<Eye>,
    error: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = std::env::var("JANUS_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "janus=debug".to_string()
        } else {
            "janus=info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref(), cli.chunk_size)?;

    match cli.command {
        Commands::Scan { file, json } => run_scan(&file, &config, json),
        Commands::Load {
            file,
            max_width,
            max_height,
            output,
            json,
        } => {
            let budget = DecodeBudget::new(max_width, max_height)?;
            let rt = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            rt.block_on(run_load(&file, budget, &config, output.as_deref(), json))
        }
        Commands::Extract { file, output, stem } => run_extract(&file, &config, &output, &stem),
    }
}

fn load_config(path: Option<&Path>, chunk_size: Option<usize>) -> Result<ScanConfig> {
    let mut config = match path {
        Some(path) => ScanConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => ScanConfig::default(),
    };
    if let Some(size) = chunk_size {
        config = config.with_chunk_size(size);
    }
    config.validate().context("Invalid scan config")?;
    Ok(config)
}

fn open(path: &Path) -> Result<Box<dyn ByteSource>> {
    open_source(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn run_scan(path: &Path, config: &ScanConfig, json: bool) -> Result<()> {
    let source = open(path)?;
    let signatures = config.signature_set()?;
    let offsets = scan_offsets(&source, &signatures, config.chunk_size)
        .with_context(|| format!("Failed to scan {}", path.display()))?;
    let assignment = classify(&offsets);

    if json {
        let report = ScanReport {
            file: source.name(),
            size: source.size(),
            offsets: &offsets,
            assignment: assignment.as_ref().ok().copied(),
            error: assignment.as_ref().err().map(ToString::to_string),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match source.size() {
        Some(size) => println!("{} ({})", source.name(), format_size(size, BINARY)),
        None => println!("{}", source.name()),
    }
    println!("{:<6} {:>12}", "INDEX", "OFFSET");
    println!("{}", "-".repeat(19));
    for (i, offset) in offsets.iter().enumerate() {
        println!("{:<6} {:>12}", i, offset);
    }
    match assignment {
        Ok(a) => println!("\nleft: {}  right: {}", a.left, a.right),
        Err(e) => println!("\n{e}"),
    }
    Ok(())
}

async fn run_load(
    path: &Path,
    budget: DecodeBudget,
    config: &ScanConfig,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let source: Arc<dyn ByteSource> = Arc::from(open(path)?);
    let file = source.name().to_string();
    let load = spawn_load(source, budget, config)?;
    let cancel = load.cancel_token();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let slot = StereoSlot::new();
    match load.wait().await {
        Ok(pair) => {
            slot.publish(pair);
        }
        Err(e) if json => {
            let report = LoadReport {
                file,
                stage: e.stage(),
                assignment: None,
                eyes: Vec::new(),
                failed_eye: e.eye(),
                error: Some(e.to_string()),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Err(PipelineError::Cancelled { stage }) => {
            println!("Cancelled while {stage}");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to load {}", path.display())),
    }

    let Some(pair) = slot.take() else {
        return Ok(());
    };

    if json {
        let report = LoadReport {
            file,
            stage: PipelineStage::Done,
            assignment: Some(pair.assignment),
            eyes: [Eye::Left, Eye::Right]
                .into_iter()
                .map(|eye| EyeReport::new(eye, pair.eye(eye)))
                .collect(),
            failed_eye: None,
            error: None,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_pair_summary(&pair);
    }

    if let Some(dir) = output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for eye in [Eye::Left, Eye::Right] {
            let out = dir.join(format!("{eye}.png"));
            pair.eye(eye)
                .pixels()
                .save(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            if !json {
                println!("Wrote {}", out.display());
            }
        }
    }
    Ok(())
}

fn print_pair_summary(pair: &StereoPair) {
    println!("{}", pair.display_name);
    for eye in [Eye::Left, Eye::Right] {
        let image = pair.eye(eye);
        let (w, h) = image.original_dimensions();
        println!(
            "{:<6} offset {:>10}  {}x{} -> {}x{} (1/{})",
            eye.name(),
            image.offset(),
            w,
            h,
            image.width(),
            image.height(),
            image.downscale()
        );
    }
}

fn run_extract(path: &Path, config: &ScanConfig, output: &Path, stem: &str) -> Result<()> {
    let source = open(path)?;
    let signatures = config.signature_set()?;
    let offsets = scan_offsets(&source, &signatures, config.chunk_size)
        .with_context(|| format!("Failed to scan {}", path.display()))?;
    if offsets.is_empty() {
        anyhow::bail!("No embedded images found in {}", path.display());
    }

    let written = extract_sub_images(&source, &offsets, output, stem)
        .with_context(|| format!("Failed to extract {}", path.display()))?;
    for file in &written {
        println!("{}", file.display());
    }
    Ok(())
}

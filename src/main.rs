//! mycolog command-line front end for the spore measurement store.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use mycolog::Workbench;
use mycolog::bundle::{IncludeFlags, Reporter};
use mycolog::config::{AppPaths, LogLevel};
use mycolog::ml_export::{CocoWriter, DatasetWriter, MlExportOptions, YoloWriter};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "mycolog")]
#[command(about = "Spore morphometry store: statistics, calibrations, bundles and ML export")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to the per-user application directory).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print spore statistics for an observation.
    Stats {
        observation_id: i64,
    },

    /// List the calibration history of an objective.
    Calibrations {
        objective: String,
    },

    /// Show data availability and reference values for a species.
    Species {
        genus: String,
        species: String,
    },

    /// Write observations, images and measurements to a zip bundle.
    ExportBundle {
        /// Bundle to create.
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        include: CliIncludeArgs,
    },

    /// Merge a zip bundle into the store.
    ImportBundle {
        /// Bundle to read.
        #[arg(long)]
        input: PathBuf,

        #[command(flatten)]
        include: CliIncludeArgs,
    },

    /// Export spore annotations as a training dataset.
    ExportMl {
        /// Output directory.
        #[arg(long)]
        out: PathBuf,

        #[arg(long, value_enum, default_value_t = MlFormatArg::Coco)]
        format: MlFormatArg,

        /// Export every image of this observation.
        #[arg(long)]
        observation: Option<i64>,

        /// Image ids to export (in addition to --observation).
        #[arg(long = "image", value_name = "ID")]
        images: Vec<i64>,

        /// Bounding box padding as a fraction of the spore size.
        #[arg(long)]
        padding: Option<f64>,

        /// Keep images without annotations.
        #[arg(long)]
        keep_empty: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct CliIncludeArgs {
    #[arg(long)]
    no_observations: bool,

    #[arg(long)]
    no_images: bool,

    #[arg(long)]
    no_measurements: bool,

    #[arg(long)]
    no_calibrations: bool,

    #[arg(long)]
    no_reference_values: bool,
}

impl CliIncludeArgs {
    fn to_flags(&self) -> IncludeFlags {
        IncludeFlags {
            observations: !self.no_observations,
            images: !self.no_images,
            measurements: !self.no_measurements,
            calibrations: !self.no_calibrations,
            reference_values: !self.no_reference_values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MlFormatArg {
    Coco,
    Yolo,
}

fn print_progress(text: &str, current: usize, total: usize) {
    eprintln!("[{}/{}] {}", current, total, text);
}

fn run_stats(bench: &Workbench, observation_id: i64) -> CliResult<()> {
    match bench.observation_statistics(observation_id)? {
        Some(stats) => println!("{}", stats.literature_string()),
        None => println!("Observation {} has no spore measurements", observation_id),
    }
    Ok(())
}

fn run_calibrations(bench: &Workbench, objective: &str) -> CliResult<()> {
    let history = mycolog::calibration::calibration_history(bench.database(), objective)?;
    if history.is_empty() {
        println!("No calibrations for {}", objective);
        return Ok(());
    }
    for entry in history {
        let cal = &entry.calibration;
        let diff = entry
            .diff_from_first_percent
            .map(|d| format!("{:+.2}%", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {}  {:.6} µm/px  n={}  {:>8}{}",
            cal.id,
            cal.calibration_date,
            cal.microns_per_pixel,
            cal.num_measurements,
            diff,
            if cal.is_active { "  (active)" } else { "" }
        );
    }
    Ok(())
}

fn run_species(bench: &mut Workbench, genus: &str, species: &str) -> CliResult<()> {
    let (name, has_data) = bench.species_display_name(genus, species, None)?;
    println!("{}", name);
    if !has_data {
        println!("  no measurements or reference values");
        return Ok(());
    }
    let info = bench.species_info(genus, species, None)?;
    println!("  measurements: {}", info.measurement_count);
    if let Some(values) = bench.references().get(genus, species, None, None)? {
        println!("{}", serde_json::to_string_pretty(&values)?);
    }
    Ok(())
}

fn run_export_ml(
    bench: &Workbench,
    out: &std::path::Path,
    format: MlFormatArg,
    observation: Option<i64>,
    mut image_ids: Vec<i64>,
    padding: Option<f64>,
    keep_empty: bool,
) -> CliResult<()> {
    if let Some(observation_id) = observation {
        for image in bench.database().images_for_observation(observation_id)? {
            if !image_ids.contains(&image.id) {
                image_ids.push(image.id);
            }
        }
    }
    if image_ids.is_empty() {
        return Err("no images selected (use --observation or --image)".into());
    }
    let mut options = MlExportOptions {
        skip_empty: !keep_empty,
        ..MlExportOptions::default()
    };
    if let Some(padding) = padding {
        options.padding = padding;
    }
    let writer: &dyn DatasetWriter = match format {
        MlFormatArg::Coco => &CocoWriter,
        MlFormatArg::Yolo => &YoloWriter,
    };
    let stats = bench.export_ml(&image_ids, out, writer, &options)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.to_level_filter())
        .init();

    let paths = match cli.data_dir {
        Some(dir) => AppPaths::new(dir),
        None => AppPaths::from_default_dir()?,
    };
    let mut bench = Workbench::open(paths)?;

    match cli.command {
        Commands::Stats { observation_id } => run_stats(&bench, observation_id)?,
        Commands::Calibrations { objective } => run_calibrations(&bench, &objective)?,
        Commands::Species { genus, species } => run_species(&mut bench, &genus, &species)?,
        Commands::ExportBundle { out, include } => {
            let mut progress = print_progress;
            let mut reporter = Reporter::silent().with_progress(&mut progress);
            let summary = bench.export_bundle(&out, include.to_flags(), &mut reporter)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ImportBundle { input, include } => {
            let mut progress = print_progress;
            let mut reporter = Reporter::silent().with_progress(&mut progress);
            let summary = bench.import_bundle(&input, include.to_flags(), &mut reporter)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ExportMl {
            out,
            format,
            observation,
            images,
            padding,
            keep_empty,
        } => run_export_ml(&bench, &out, format, observation, images, padding, keep_empty)?,
    }
    Ok(())
}

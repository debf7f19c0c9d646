// Version information constants
const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::error::Error;
use std::io::{BufWriter, Write};

use clap::{Parser, Subcommand};

mod cluster;
mod ehr;
mod error;
mod features;
mod generate;
mod image;
mod io;
mod journeys;
mod multiview;
mod outcomes;
mod pathways;
mod pipeline;
mod progress;
mod segment;
mod sequences;
mod visualize;

/// Logger manager supporting dynamic progress display and detailed logging
pub struct Logger {
    writer: BufWriter<std::fs::File>,
    last_progress: String,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
            last_progress: String::new(),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Display dynamic progress information (overwrite previous line)
    pub fn progress(&mut self, message: &str) -> std::io::Result<()> {
        if !self.last_progress.is_empty() {
            print!("\r{}", " ".repeat(self.last_progress.len()));
        }

        print!("\r{}", message);
        std::io::stdout().flush()?;

        self.last_progress = message.to_string();
        Ok(())
    }

    /// Finish progress display
    pub fn finish_progress(&mut self) -> std::io::Result<()> {
        if !self.last_progress.is_empty() {
            println!();
            self.last_progress.clear();
        }
        Ok(())
    }

    /// Record log and display progress simultaneously
    pub fn log_and_progress(&mut self, message: &str) -> std::io::Result<()> {
        self.log(message)?;
        self.progress(message)?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the synthetic microscopy scene and its paired views
    Generate(generate::GenerateArgs),
    /// Segment the synthetic image with marker-based watershed
    Segment(segment::SegmentArgs),
    /// Measure regions and map them to ground-truth cells
    Features(features::FeatureArgs),
    /// Assemble the fused two-view cell table
    Multiview(multiview::MultiviewArgs),
    /// Cluster cells with a tempered Gaussian mixture
    Cluster(cluster::ClusterArgs),
    /// Render result figures and merge the microscopy metrics
    Visualize(visualize::VisualizeArgs),
    /// Generate the synthetic patient event log
    GenerateEhr(ehr::EhrArgs),
    /// Build per-patient sequences and the journey feature table
    Sequences(sequences::SequenceArgs),
    /// Render cohort pathway structure (heatmap and Sankey)
    Pathways(pathways::PathwayArgs),
    /// Cluster patient journeys into typologies
    Journeys(journeys::JourneyArgs),
    /// Predict admission from early signals and merge the journey metrics
    Outcomes(outcomes::OutcomeArgs),
    /// Run a named pipeline end to end
    Run(pipeline::PipelineArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Generate(args) => generate::run(&args),
        Commands::Segment(args) => segment::run(&args),
        Commands::Features(args) => features::run(&args),
        Commands::Multiview(args) => multiview::run(&args),
        Commands::Cluster(args) => cluster::run(&args),
        Commands::Visualize(args) => visualize::run(&args),
        Commands::GenerateEhr(args) => ehr::run(&args),
        Commands::Sequences(args) => sequences::run(&args),
        Commands::Pathways(args) => pathways::run(&args),
        Commands::Journeys(args) => journeys::run(&args),
        Commands::Outcomes(args) => outcomes::run(&args),
        Commands::Run(args) => pipeline::run(&args),
    }
}

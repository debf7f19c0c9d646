//! Sequential pipeline driver. Each stage declares the files it reads and
//! writes; inputs are checked before the stage runs, so a failure is pinned
//! to the stage that owns it rather than surfacing downstream.

use clap::Args;
use std::error::Error;
use std::time::Instant;

use crate::io::require_input;
use crate::progress;
use crate::{
    cluster, ehr, features, generate, journeys, multiview, outcomes, pathways, segment,
    sequences, visualize,
};

type StageFn = Box<dyn Fn() -> Result<(), Box<dyn Error>>>;

pub struct Stage {
    pub name: &'static str,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    run: StageFn,
}

impl Stage {
    fn new(name: &'static str, inputs: &[&str], outputs: &[&str], run: StageFn) -> Self {
        Self {
            name,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            run,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Pipeline to execute: microscopy, journeys or all
    #[arg(short = 'p', long = "pipeline", default_value = "all")]
    pub pipeline: String,
    /// Seed override for every seeded stage
    #[arg(long = "seed")]
    pub seed: Option<u64>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for PipelineArgs {
    fn default() -> Self {
        Self {
            pipeline: "all".to_string(),
            seed: None,
            log: None,
        }
    }
}

fn validate_pipeline_args(args: &PipelineArgs) -> Result<(), Box<dyn Error>> {
    if !matches!(args.pipeline.as_str(), "microscopy" | "journeys" | "all") {
        return Err(format!(
            "Error: unknown pipeline '{}', expected microscopy, journeys or all",
            args.pipeline
        )
        .into());
    }
    Ok(())
}

/// The microscopy pipeline in execution order.
pub fn microscopy_stages(seed: Option<u64>) -> Vec<Stage> {
    let gen_args = generate::GenerateArgs {
        seed: seed.unwrap_or_else(|| generate::GenerateArgs::default().seed),
        ..generate::GenerateArgs::default()
    };
    let seg_args = segment::SegmentArgs::default();
    let feat_args = features::FeatureArgs::default();
    let view_args = multiview::MultiviewArgs::default();
    let cluster_args = cluster::ClusterArgs {
        seed: seed.unwrap_or_else(|| cluster::ClusterArgs::default().seed),
        ..cluster::ClusterArgs::default()
    };
    let vis_args = visualize::VisualizeArgs {
        seed: seed.unwrap_or_else(|| visualize::VisualizeArgs::default().seed),
        ..visualize::VisualizeArgs::default()
    };

    vec![
        Stage::new(
            "generate",
            &[],
            &[
                "data/raw/microscopy_image.csv",
                "data/raw/gt_mask.csv",
                "data/raw/cell_metadata.csv",
                "data/raw/barcode_view.csv",
            ],
            Box::new(move || generate::run(&gen_args)),
        ),
        Stage::new(
            "segment",
            &["data/raw/microscopy_image.csv"],
            &["data/processed/seg_mask.csv"],
            Box::new(move || segment::run(&seg_args)),
        ),
        Stage::new(
            "features",
            &[
                "data/raw/microscopy_image.csv",
                "data/raw/gt_mask.csv",
                "data/processed/seg_mask.csv",
                "data/raw/barcode_view.csv",
            ],
            &[
                "data/processed/morph_features.csv",
                "data/processed/mapped_cells.csv",
            ],
            Box::new(move || features::run(&feat_args)),
        ),
        Stage::new(
            "multiview",
            &["data/processed/mapped_cells.csv"],
            &["reports/cell_table.csv"],
            Box::new(move || multiview::run(&view_args)),
        ),
        Stage::new(
            "cluster",
            &["reports/cell_table.csv"],
            &[
                "reports/cluster_assignments.csv",
                "reports/cluster_summary.csv",
            ],
            Box::new(move || cluster::run(&cluster_args)),
        ),
        Stage::new(
            "visualize",
            &[
                "data/raw/gt_mask.csv",
                "data/processed/seg_mask.csv",
                "reports/cell_table.csv",
                "reports/cluster_assignments.csv",
            ],
            &["reports/metrics.json"],
            Box::new(move || visualize::run(&vis_args)),
        ),
    ]
}

/// The patient-journey pipeline in execution order.
pub fn journey_stages(seed: Option<u64>) -> Vec<Stage> {
    let ehr_args = ehr::EhrArgs {
        seed: seed.unwrap_or_else(|| ehr::EhrArgs::default().seed),
        ..ehr::EhrArgs::default()
    };
    let seq_args = sequences::SequenceArgs::default();
    let path_args = pathways::PathwayArgs::default();
    let journey_args = journeys::JourneyArgs {
        seed: seed.unwrap_or_else(|| journeys::JourneyArgs::default().seed),
        ..journeys::JourneyArgs::default()
    };
    let outcome_args = outcomes::OutcomeArgs {
        seed: seed.unwrap_or_else(|| outcomes::OutcomeArgs::default().seed),
        ..outcomes::OutcomeArgs::default()
    };

    vec![
        Stage::new(
            "generate-ehr",
            &[],
            &["data/raw/event_log.csv"],
            Box::new(move || ehr::run(&ehr_args)),
        ),
        Stage::new(
            "sequences",
            &["data/raw/event_log.csv"],
            &[
                "data/processed/journeys.csv",
                "reports/journey_features.csv",
            ],
            Box::new(move || sequences::run(&seq_args)),
        ),
        Stage::new(
            "pathways",
            &["data/raw/event_log.csv"],
            &[
                "figures/transition_heatmap.png",
                "reports/sankey_pathways.html",
            ],
            Box::new(move || pathways::run(&path_args)),
        ),
        Stage::new(
            "journeys",
            &["reports/journey_features.csv"],
            &[
                "reports/journey_clusters.csv",
                "reports/journey_cluster_summary.csv",
            ],
            Box::new(move || journeys::run(&journey_args)),
        ),
        Stage::new(
            "outcomes",
            &["reports/journey_features.csv"],
            &["reports/metrics.json"],
            Box::new(move || outcomes::run(&outcome_args)),
        ),
    ]
}

fn execute(stages: &[Stage], logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    let total = stages.len();
    for (i, stage) in stages.iter().enumerate() {
        println!();
        println!("=== Stage {}/{}: {} ===", i + 1, total, stage.name);
        logger.log_and_progress(&format!("Stage {}/{}: {}", i + 1, total, stage.name))?;
        logger.finish_progress()?;

        for input in &stage.inputs {
            require_input(input).map_err(|e| -> Box<dyn Error> {
                format!("Error: stage '{}' is missing an input: {}", stage.name, e).into()
            })?;
        }
        (stage.run)().map_err(|e| -> Box<dyn Error> {
            format!("Error: stage '{}' failed: {}", stage.name, e).into()
        })?;
        logger.log(&format!("Stage '{}' completed", stage.name))?;
    }
    Ok(())
}

pub fn run(args: &PipelineArgs) -> Result<(), Box<dyn Error>> {
    validate_pipeline_args(args)?;
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("pipeline.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Pipeline Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Pipeline: {}", args.pipeline))?;
    if let Some(seed) = args.seed {
        logger.log(&format!("Seed override: {}", seed))?;
    }

    println!("[Params]");
    println!("    Pipeline: {}.", args.pipeline);
    match args.seed {
        Some(seed) => println!("    Seed override: {}.", seed),
        None => println!("    Seeds: stage defaults."),
    }

    if matches!(args.pipeline.as_str(), "microscopy" | "all") {
        execute(&microscopy_stages(args.seed), &mut logger)?;
    }
    if matches!(args.pipeline.as_str(), "journeys" | "all") {
        execute(&journey_stages(args.seed), &mut logger)?;
    }

    let elapsed = start_time.elapsed();
    println!();
    println!("{}", progress::format_time_used(elapsed));
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every stage input must be produced by an earlier stage, except the
    // sourceless generators at the front.
    fn assert_graph_is_closed(stages: &[Stage]) {
        let mut produced: Vec<String> = Vec::new();
        for stage in stages {
            for input in &stage.inputs {
                assert!(
                    produced.contains(input),
                    "stage '{}' reads '{}' which no earlier stage writes",
                    stage.name,
                    input
                );
            }
            produced.extend(stage.outputs.iter().cloned());
        }
    }

    #[test]
    fn microscopy_graph_is_closed() {
        assert_graph_is_closed(&microscopy_stages(None));
    }

    #[test]
    fn journey_graph_is_closed() {
        assert_graph_is_closed(&journey_stages(None));
    }

    #[test]
    fn microscopy_stage_order_is_fixed() {
        let names: Vec<&str> = microscopy_stages(None).iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "generate",
                "segment",
                "features",
                "multiview",
                "cluster",
                "visualize"
            ]
        );
    }

    #[test]
    fn journey_stage_order_is_fixed() {
        let names: Vec<&str> = journey_stages(None).iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "generate-ehr",
                "sequences",
                "pathways",
                "journeys",
                "outcomes"
            ]
        );
    }

    #[test]
    fn unknown_pipeline_name_is_rejected() {
        let args = PipelineArgs {
            pipeline: "everything".to_string(),
            ..PipelineArgs::default()
        };
        assert!(validate_pipeline_args(&args).is_err());
    }
}

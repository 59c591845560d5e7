//! Validate command - checks a lab file and summarizes it.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use labflow_engine::Lab;
use serde::Serialize;

use super::Context;
use crate::sim::SimDriverFactory;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Lab file to check
    pub lab: PathBuf,
}

#[derive(Debug, Serialize)]
struct WorkflowSummary {
    name: String,
    threads: usize,
    spawned: usize,
    joins: usize,
}

/// Validation summary for JSON output.
#[derive(Debug, Serialize)]
struct ValidateOutput {
    valid: bool,
    locations: usize,
    equipment: usize,
    transporters: usize,
    pools: usize,
    labware: usize,
    methods: usize,
    workflows: Vec<WorkflowSummary>,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let catalog = super::load_lab(&args.lab)?;
    let lab = Lab::from_config(&catalog, &SimDriverFactory::new())?;

    let output = ValidateOutput {
        valid: true,
        locations: catalog.locations.len(),
        equipment: catalog.equipment.len(),
        transporters: lab.transporters().len(),
        pools: catalog.pools.len(),
        labware: catalog.labware.len(),
        methods: catalog.methods.len(),
        workflows: catalog
            .workflows
            .iter()
            .map(|w| WorkflowSummary {
                name: w.name.clone(),
                threads: w.threads.len(),
                spawned: w.spawns.len(),
                joins: w.joins.len(),
            })
            .collect(),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!(
        "{} {}",
        style(args.lab.display()).bold(),
        Style::new().green().apply_to("is valid")
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Locations:   "), output.locations);
    println!(
        "  {} {} ({} transporters)",
        dim.apply_to("Equipment:   "),
        output.equipment,
        output.transporters
    );
    println!("  {} {}", dim.apply_to("Pools:       "), output.pools);
    println!("  {} {}", dim.apply_to("Labware:     "), output.labware);
    println!("  {} {}", dim.apply_to("Methods:     "), output.methods);
    for workflow in &output.workflows {
        println!(
            "  {} {} ({} threads, {} spawned, {} joins)",
            dim.apply_to("Workflow:    "),
            workflow.name,
            workflow.threads,
            workflow.spawned,
            workflow.joins
        );
    }
    println!();
    Ok(())
}

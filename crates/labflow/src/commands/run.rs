//! Run command - executes a workflow against simulated drivers.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use labflow_engine::RunReport;
use labflow_types::{LabwareThreadStatus, WorkflowStatus};

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Lab file describing locations, equipment and workflows
    pub lab: PathBuf,

    /// Workflow to run (default: the first in the file)
    #[arg(short, long)]
    pub workflow: Option<String>,
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let catalog = super::load_lab(&args.lab)?;
    let workflow = match args.workflow {
        Some(name) => name,
        None => match catalog.workflows.first() {
            Some(w) => w.name.clone(),
            None => bail!("{} defines no workflows", args.lab.display()),
        },
    };

    let engine = super::sim_engine(catalog, ctx).await?;
    tracing::info!(workflow = %workflow, "running workflow");
    let report = engine.run_workflow(&workflow).await?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, ctx);
    }

    if report.has_errors() {
        bail!("workflow '{}' finished with errors", report.workflow);
    }
    Ok(())
}

fn print_report(report: &RunReport, ctx: &Context) {
    let dim = Style::new().dim();
    let status_style = match report.status {
        WorkflowStatus::Completed => Style::new().green(),
        WorkflowStatus::Errored => Style::new().red(),
        _ => Style::new().yellow(),
    };

    println!();
    println!(
        "{} {}",
        style(format!("Workflow {}", report.workflow)).bold(),
        status_style.apply_to(report.status)
    );
    println!("{}", dim.apply_to("─".repeat(60)));

    for thread in &report.threads {
        let marker = match thread.status {
            LabwareThreadStatus::Completed => Style::new().green().apply_to("●"),
            LabwareThreadStatus::Errored => Style::new().red().apply_to("●"),
            _ => Style::new().yellow().apply_to("●"),
        };
        println!(
            "  {} {:<20} {:<12} {}",
            marker,
            thread.name,
            thread.status.as_str(),
            dim.apply_to(thread.position.as_deref().unwrap_or("-"))
        );
        if let Some(error) = &thread.error {
            println!("      {} {}", dim.apply_to("error:"), error);
        }
        if ctx.verbose {
            println!("      {} {}", dim.apply_to("labware:"), thread.labware);
            println!("      {} {}", dim.apply_to("id:"), thread.id);
        }
    }
    println!();
}

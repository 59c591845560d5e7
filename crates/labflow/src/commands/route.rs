//! Route command - prints the planned route between two locations.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::{Style, style};

use super::Context;

/// Arguments for the route command.
#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Lab file describing locations and transporters
    pub lab: PathBuf,

    /// Starting location
    pub from: String,

    /// Destination location
    pub to: String,
}

/// Run the route command.
pub async fn run(args: RouteArgs, ctx: &Context) -> Result<()> {
    let catalog = super::load_lab(&args.lab)?;
    let engine = super::sim_engine(catalog, ctx).await?;
    let route = engine.router().route(&args.from, &args.to)?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&route)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!(
        "{}",
        style(format!("Route {} -> {}", args.from, args.to)).bold()
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    if route.is_empty() {
        println!("  {}", dim.apply_to("already there, no movement needed"));
    }
    for (i, step) in route.steps.iter().enumerate() {
        println!(
            "  {}. {} -> {} {} {}",
            i + 1,
            step.source,
            step.target,
            dim.apply_to("via"),
            step.transporter
        );
    }
    println!();
    Ok(())
}

use crate::loader::{load_covariates, load_observations};
use crate::models::{AdoptionYear, Config};
use crate::panel::{covariate_formula, null_counts, PanelBuilder};
use crate::report;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// What a run produced, for the console summary.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub adoption: Vec<AdoptionYear>,
    pub excluded_units: usize,
    pub panel_rows: usize,
    pub null_counts: Vec<(String, usize)>,
    pub unmatched_rows: usize,
    pub treated_change_sum: f64,
    pub clean_rows: usize,
    pub ultra_clean_rows: usize,
    pub formula: String,
    pub output_dir: PathBuf,
}

/// Load both inputs, build every table and write all outputs.
pub fn run(config: &Config) -> Result<RunSummary> {
    config.validate().context("invalid configuration")?;

    let output_dir = PathBuf::from(config.output_directory.as_deref().unwrap_or("output"));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let builder = PanelBuilder::new(config);

    // Panel
    let observations = load_observations(Path::new(&config.panel_file), &config.aggregate_columns)?;
    let panel_build = builder.build_panel(observations);
    let panel_columns = builder.panel_columns();
    let nulls = null_counts(&panel_build.panel, &panel_columns);

    report::write_panel(&output_dir.join(&config.outputs.panel), &panel_columns, &panel_build.panel)?;
    report::write_null_report(&output_dir.join(&config.outputs.panel_nulls), &nulls)?;
    report::write_adoption(&output_dir.join(&config.outputs.adoption), &panel_build.adoption)?;

    // Covariates
    let covariates = load_covariates(Path::new(&config.covariate_file), &config.covariate_columns)?;
    let analysis = builder.build_analysis(&panel_build.panel, &covariates)?;
    let formula = covariate_formula(&analysis.covariate_names);

    report::write_analysis(
        &output_dir.join(&config.outputs.clean),
        &panel_columns,
        &analysis.covariate_names,
        &analysis.clean,
    )?;
    report::write_analysis(
        &output_dir.join(&config.outputs.ultra_clean),
        &panel_columns,
        &analysis.covariate_names,
        &analysis.ultra_clean,
    )?;
    report::write_formula(&output_dir.join(&config.outputs.formula), &formula)?;
    info!("all outputs written to {}", output_dir.display());

    Ok(RunSummary {
        adoption: panel_build.adoption,
        excluded_units: panel_build.excluded_units.len(),
        panel_rows: panel_build.panel.len(),
        null_counts: nulls,
        unmatched_rows: analysis.unmatched_rows,
        treated_change_sum: analysis.treated_change_sum,
        clean_rows: analysis.clean.len(),
        ultra_clean_rows: analysis.ultra_clean.len(),
        formula,
        output_dir,
    })
}

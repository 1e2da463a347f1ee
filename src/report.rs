use crate::models::{AdoptionYear, AnalysisRow, PanelRow};
use anyhow::{Context, Result};
use csv::Writer;
use std::fs;
use std::path::Path;
use tracing::info;

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn panel_fields(row: &PanelRow) -> Vec<String> {
    let mut fields = vec![
        row.fips.to_string(),
        row.stfips.to_string(),
        row.cofips.to_string(),
        row.year.clone(),
        row.cyear.to_string(),
        row.treatment.to_string(),
        row.change.to_string(),
        row.period.code().to_string(),
    ];
    fields.extend(row.aggregated.iter().map(|v| format_value(*v)));
    fields
}

/// Write the aggregated panel: identifier columns followed by `_agg` columns.
pub fn write_panel(path: &Path, columns: &[String], panel: &[PanelRow]) -> Result<()> {
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(columns)?;
    for row in panel {
        writer.write_record(panel_fields(row))?;
    }

    writer.flush()?;
    info!("wrote {} panel rows to {}", panel.len(), path.display());
    Ok(())
}

pub fn write_null_report(path: &Path, counts: &[(String, usize)]) -> Result<()> {
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(["column", "missing"])?;
    for (column, missing) in counts {
        writer.write_record([column.as_str(), missing.to_string().as_str()])?;
    }

    writer.flush()?;
    Ok(())
}

/// Write merged rows: panel columns, renamed covariates, then `treated`.
pub fn write_analysis(
    path: &Path,
    panel_columns: &[String],
    covariate_names: &[String],
    rows: &[AnalysisRow],
) -> Result<()> {
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let header: Vec<&str> = panel_columns
        .iter()
        .chain(covariate_names)
        .map(String::as_str)
        .chain(std::iter::once("treated"))
        .collect();
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = panel_fields(&row.panel);
        fields.extend(row.covariates.iter().map(|v| format_value(*v)));
        fields.push(row.treated.to_string());
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    info!("wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_adoption(path: &Path, adoption: &[AdoptionYear]) -> Result<()> {
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(["cyear", "units", "switched", "fraction", "cumulative_fraction"])?;
    for year in adoption {
        writer.write_record(&[
            year.cyear.to_string(),
            year.units.to_string(),
            year.switched.to_string(),
            format!("{:.6}", year.fraction),
            format!("{:.6}", year.cumulative),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_formula(path: &Path, formula: &str) -> Result<()> {
    fs::write(path, format!("{}\n", formula))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Console table of the adoption diagnostic.
pub fn print_adoption(adoption: &[AdoptionYear]) {
    println!("\n📈 Treatment adoption by calendar year:");
    println!("   {:>5}  {:>6}  {:>8}  {:>10}", "year", "units", "fraction", "cumulative");
    for year in adoption {
        println!(
            "   {:>5}  {:>6}  {:>8.4}  {:>10.4}",
            year.cyear, year.units, year.fraction, year.cumulative
        );
    }
}

pub fn print_null_counts(counts: &[(String, usize)]) {
    let with_missing: Vec<&(String, usize)> = counts.iter().filter(|(_, n)| *n > 0).collect();
    if with_missing.is_empty() {
        println!("\n✅ No missing values in the aggregated panel");
        return;
    }
    println!("\n🕳️  Missing values in the aggregated panel:");
    for (column, missing) in with_missing {
        println!("   {}: {}", column, missing);
    }
}

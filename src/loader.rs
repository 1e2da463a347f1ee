use crate::models::{CovariateRecord, Observation, Period};
use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

static LEADING_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{4})").expect("static regex"));

const MISSING_MARKERS: [&str; 5] = ["", "NA", "NaN", "nan", "."];

/// Column positions of a CSV header, looked up by name.
struct HeaderIndex {
    names: Vec<String>,
    source: String,
}

impl HeaderIndex {
    fn new(headers: &StringRecord, source: &Path) -> Self {
        Self {
            names: headers.iter().map(|h| h.trim().to_string()).collect(),
            source: source.display().to_string(),
        }
    }

    fn position(&self, column: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| anyhow!("column `{}` not found in {}", column, self.source))
    }

    fn positions(&self, columns: &[String]) -> Result<Vec<usize>> {
        columns.iter().map(|c| self.position(c)).collect()
    }
}

/// Parse a numeric cell; Stata and pandas style missing markers map to `None`.
pub fn parse_value(raw: &str) -> Result<Option<f64>> {
    let trimmed = raw.trim();
    if MISSING_MARKERS.contains(&trimmed) {
        return Ok(None);
    }
    let value = trimmed
        .parse::<f64>()
        .with_context(|| format!("not a number: `{}`", raw))?;
    Ok(if value.is_nan() { None } else { Some(value) })
}

/// Parse an identifier cell such as `1001` or `1001.0`.
pub fn parse_id(raw: &str) -> Result<u32> {
    let value = parse_value(raw)?.ok_or_else(|| anyhow!("missing identifier"))?;
    if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
        bail!("identifier is not a non-negative integer: `{}`", raw);
    }
    Ok(value as u32)
}

/// Calendar year from a date-like cell: `1959`, `1959-01-01`, `1959.0`.
pub fn calendar_year(raw: &str) -> Result<i32> {
    let caps = LEADING_YEAR
        .captures(raw)
        .ok_or_else(|| anyhow!("cannot read a calendar year from `{}`", raw))?;
    Ok(caps[1].parse::<i32>()?)
}

fn cell<'r>(record: &'r StringRecord, position: usize) -> &'r str {
    record.get(position).unwrap_or("")
}

/// Read the county-year panel. Only the identifier columns, `chc_year_exp`,
/// `exp2` and the declared aggregate columns are kept.
///
/// `treatment`, `change` and `period` are left at neutral values here and
/// assigned by the labelling stages.
pub fn load_observations(path: &Path, aggregate_columns: &[String]) -> Result<Vec<Observation>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open panel CSV: {}", path.display()))?;
    let headers = HeaderIndex::new(reader.headers()?, path);

    let fips = headers.position("fips")?;
    let stfips = headers.position("stfips")?;
    let cofips = headers.position("cofips")?;
    let year = headers.position("year")?;
    let chc_year_exp = headers.position("chc_year_exp")?;
    let exp2 = headers.position("exp2")?;
    let value_positions = headers.positions(aggregate_columns)?;

    let mut observations = Vec::new();
    for (i, result) in reader.records().enumerate() {
        // header is line 1
        let line = i + 2;
        let record = result.with_context(|| format!("{}:{}", path.display(), line))?;
        let parse = || -> Result<Observation> {
            let raw_year = cell(&record, year).trim().to_string();
            Ok(Observation {
                fips: parse_id(cell(&record, fips)).context("fips")?,
                stfips: parse_id(cell(&record, stfips)).context("stfips")?,
                cofips: parse_id(cell(&record, cofips)).context("cofips")?,
                cyear: calendar_year(&raw_year)?,
                year: raw_year,
                chc_year_exp: parse_value(cell(&record, chc_year_exp)).context("chc_year_exp")?,
                exp2: parse_value(cell(&record, exp2)).context("exp2")?,
                treatment: 0,
                change: 0.0,
                period: Period::Transition,
                values: value_positions
                    .iter()
                    .zip(aggregate_columns)
                    .map(|(&p, name)| parse_value(cell(&record, p)).context(name.clone()))
                    .collect::<Result<Vec<_>>>()?,
            })
        };
        observations.push(parse().with_context(|| format!("{}:{}", path.display(), line))?);
    }

    info!("loaded {} observations from {}", observations.len(), path.display());
    Ok(observations)
}

/// Read the covariate table keyed by `(stfips, cofips)`.
pub fn load_covariates(path: &Path, covariate_columns: &[String]) -> Result<Vec<CovariateRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open covariate CSV: {}", path.display()))?;
    let headers = HeaderIndex::new(reader.headers()?, path);

    let stfips = headers.position("stfips")?;
    let cofips = headers.position("cofips")?;
    let value_positions = headers.positions(covariate_columns)?;

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let line = i + 2;
        let record = result.with_context(|| format!("{}:{}", path.display(), line))?;
        let parse = || -> Result<CovariateRecord> {
            Ok(CovariateRecord {
                stfips: parse_id(cell(&record, stfips)).context("stfips")?,
                cofips: parse_id(cell(&record, cofips)).context("cofips")?,
                values: value_positions
                    .iter()
                    .zip(covariate_columns)
                    .map(|(&p, name)| parse_value(cell(&record, p)).context(name.clone()))
                    .collect::<Result<Vec<_>>>()?,
            })
        };
        let covariate = parse().with_context(|| format!("{}:{}", path.display(), line))?;
        if !seen.insert((covariate.stfips, covariate.cofips)) {
            bail!(
                "{}:{}: duplicate covariate key stfips={} cofips={}",
                path.display(),
                line,
                covariate.stfips,
                covariate.cofips
            );
        }
        records.push(covariate);
    }

    debug!("covariate columns: {}", covariate_columns.join(", "));
    info!("loaded {} covariate rows from {}", records.len(), path.display());
    Ok(records)
}

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const SAMPLE_START_YEAR: i32 = 1959;
pub const SAMPLE_END_YEAR: i32 = 1980;
pub const PRE_PERIOD_LAST_YEAR: i32 = 1964;
pub const POST_PERIOD_FIRST_YEAR: i32 = 1975;
pub const EXCLUSION_FIRST_YEAR: i32 = 1975;
pub const EXCLUSION_LAST_YEAR: i32 = 1980;

/// Columns that identify an observation or are derived by the pipeline.
/// They are carried through the panel but never averaged.
pub const META_COLUMNS: [&str; 8] = [
    "fips",
    "stfips",
    "cofips",
    "year",
    "cyear",
    "treatment",
    "change",
    "period",
];

pub const AGGREGATE_SUFFIX: &str = "_agg";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub panel_file: String,
    pub covariate_file: String,
    pub output_directory: Option<String>,
    pub aggregate_columns: Vec<String>,
    pub outcome_columns: Vec<String>,
    pub covariate_columns: Vec<String>,
    #[serde(default)]
    pub strict_sanity_check: bool,
    #[serde(default)]
    pub outputs: OutputFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFiles {
    pub panel: String,
    pub panel_nulls: String,
    pub clean: String,
    pub ultra_clean: String,
    pub adoption: String,
    pub formula: String,
}

impl Default for OutputFiles {
    fn default() -> Self {
        Self {
            panel: "aer_data_panel.csv".to_string(),
            panel_nulls: "aer_data_panel_null.csv".to_string(),
            clean: "aer_pscore_data_panel_clean.csv".to_string(),
            ultra_clean: "aer_pscore_data_panel_ultra_clean.csv".to_string(),
            adoption: "treatment_adoption.csv".to_string(),
            formula: "covariate_formula.txt".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panel_file: "aer_data.csv".to_string(),
            covariate_file: "aer_pscore_data.csv".to_string(),
            output_directory: Some("output".to_string()),
            aggregate_columns: vec![
                "amr".to_string(),
                "amr_ad".to_string(),
                "amr_eld".to_string(),
                "amr_ch".to_string(),
                "chc_year_exp".to_string(),
                "exp2".to_string(),
                "copop".to_string(),
            ],
            outcome_columns: vec!["amr".to_string(), "amr_eld".to_string()],
            covariate_columns: vec![
                "_60pcturban".to_string(),
                "_60pctrurf".to_string(),
                "_60pcnonwhit".to_string(),
                "_60pct04years".to_string(),
                "_60pctmt64years".to_string(),
                "_pct59inclt3k".to_string(),
                "_pct59incmt10k".to_string(),
                "_60medschlmt24".to_string(),
                "_tot_act_md_t".to_string(),
            ],
            strict_sanity_check: false,
            outputs: OutputFiles::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }

    /// Check the declared schema before any data is read.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.aggregate_columns.is_empty() {
            bail!("aggregate_columns is empty");
        }
        if self.outcome_columns.is_empty() {
            bail!("outcome_columns is empty");
        }
        if self.covariate_columns.is_empty() {
            bail!("covariate_columns is empty");
        }

        if let Some(meta) = self
            .aggregate_columns
            .iter()
            .find(|c| META_COLUMNS.contains(&c.as_str()))
        {
            bail!("`{}` is an identifier column and cannot be aggregated", meta);
        }
        for outcome in &self.outcome_columns {
            if !self.aggregate_columns.contains(outcome) {
                bail!("outcome `{}` is not listed in aggregate_columns", outcome);
            }
        }

        for (label, columns) in [
            ("aggregate_columns", &self.aggregate_columns),
            ("covariate_columns", &self.covariate_columns),
        ] {
            let mut seen = HashSet::new();
            for column in columns {
                if !seen.insert(column.as_str()) {
                    bail!("`{}` is listed twice in {}", column, label);
                }
            }
        }
        Ok(())
    }

    /// Aggregated names of the outcome columns, e.g. `amr` -> `amr_agg`.
    pub fn aggregated_outcomes(&self) -> Vec<String> {
        self.outcome_columns.iter().map(|c| aggregated_name(c)).collect()
    }
}

pub fn aggregated_name(column: &str) -> String {
    format!("{}{}", column, AGGREGATE_SUFFIX)
}

/// Coarse pre/post label of a calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Pre,
    Post,
    Transition,
}

impl Period {
    pub fn code(self) -> i32 {
        match self {
            Period::Pre => 0,
            Period::Post => 1,
            Period::Transition => -99,
        }
    }
}

/// Year boundaries of the sample, the pre/post periods and the tail window
/// used to exclude late-treated units from the control group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodPolicy {
    pub sample_start: i32,
    pub sample_end: i32,
    pub pre_last: i32,
    pub post_first: i32,
    pub exclusion_first: i32,
    pub exclusion_last: i32,
}

impl Default for PeriodPolicy {
    fn default() -> Self {
        Self {
            sample_start: SAMPLE_START_YEAR,
            sample_end: SAMPLE_END_YEAR,
            pre_last: PRE_PERIOD_LAST_YEAR,
            post_first: POST_PERIOD_FIRST_YEAR,
            exclusion_first: EXCLUSION_FIRST_YEAR,
            exclusion_last: EXCLUSION_LAST_YEAR,
        }
    }
}

impl PeriodPolicy {
    pub fn classify(&self, year: i32) -> Period {
        if year <= self.pre_last {
            Period::Pre
        } else if year >= self.post_first {
            Period::Post
        } else {
            Period::Transition
        }
    }

    pub fn in_sample(&self, year: i32) -> bool {
        (self.sample_start..=self.sample_end).contains(&year)
    }

    pub fn in_exclusion_window(&self, year: i32) -> bool {
        (self.exclusion_first..=self.exclusion_last).contains(&year)
    }
}

/// One county in one calendar year.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub fips: u32,
    pub stfips: u32,
    pub cofips: u32,
    /// Raw `year` cell as read from the input.
    pub year: String,
    pub cyear: i32,
    pub chc_year_exp: Option<f64>,
    pub exp2: Option<f64>,
    pub treatment: u8,
    pub change: f64,
    pub period: Period,
    /// Values of the declared aggregate columns, in declaration order.
    pub values: Vec<Option<f64>>,
}

/// One county in one period, carrying the averaged columns.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRow {
    pub fips: u32,
    pub stfips: u32,
    pub cofips: u32,
    pub year: String,
    pub cyear: i32,
    pub treatment: u8,
    pub change: f64,
    pub period: Period,
    pub aggregated: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CovariateRecord {
    pub stfips: u32,
    pub cofips: u32,
    pub values: Vec<Option<f64>>,
}

/// Panel row joined with its covariates and the back-filled `treated` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRow {
    pub panel: PanelRow,
    pub covariates: Vec<Option<f64>>,
    pub treated: u8,
}

/// Per-year share of the sample switching into treatment.
#[derive(Debug, Clone, PartialEq)]
pub struct AdoptionYear {
    pub cyear: i32,
    pub units: usize,
    pub switched: f64,
    pub fraction: f64,
    pub cumulative: f64,
}

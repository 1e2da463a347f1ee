use crate::models::{
    aggregated_name, AdoptionYear, AnalysisRow, Config, CovariateRecord, Observation, PanelRow,
    Period, PeriodPolicy, META_COLUMNS,
};
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

/// Result of reshaping the county-year observations into the two-period panel.
#[derive(Debug, Clone)]
pub struct PanelBuild {
    pub panel: Vec<PanelRow>,
    pub adoption: Vec<AdoptionYear>,
    pub excluded_units: Vec<u32>,
}

/// Result of merging covariates onto the panel.
#[derive(Debug, Clone)]
pub struct AnalysisBuild {
    pub covariate_names: Vec<String>,
    pub clean: Vec<AnalysisRow>,
    pub ultra_clean: Vec<AnalysisRow>,
    pub unmatched_rows: usize,
    pub treated_change_sum: f64,
}

pub struct PanelBuilder<'a> {
    pub config: &'a Config,
    pub policy: PeriodPolicy,
}

impl<'a> PanelBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            policy: PeriodPolicy::default(),
        }
    }

    /// Label, restrict and average the observations into one row per county and period.
    pub fn build_panel(&self, observations: Vec<Observation>) -> PanelBuild {
        let total = observations.len();

        // Step 1: Derive the treatment flag from the calendar year
        let labelled = label_treatment(observations);

        // Step 2: Keep the analysis window only
        let in_sample = restrict_to_sample(labelled, &self.policy);
        info!("{} of {} observations inside the sample window", in_sample.len(), total);

        // Step 3: Drop units that were still unexposed in the tail window
        let (kept, excluded_units) = exclude_late_units(in_sample, &self.policy);
        info!(
            "excluded {} units unexposed in {}-{}, {} observations remain",
            excluded_units.len(),
            self.policy.exclusion_first,
            self.policy.exclusion_last,
            kept.len()
        );

        // Step 4: Status changes and the adoption diagnostic
        let changed = mark_status_changes(kept);
        let adoption = adoption_by_year(&changed);

        // Step 5: Pre/post labels, then average within county x period
        let labelled = assign_periods(changed, &self.policy);
        let panel = aggregate_panel(&labelled);
        info!("aggregated panel has {} county-period rows", panel.len());

        PanelBuild {
            panel,
            adoption,
            excluded_units,
        }
    }

    /// Merge covariates, impute, back-fill `treated`, rename and filter.
    pub fn build_analysis(
        &self,
        panel: &[PanelRow],
        covariates: &[CovariateRecord],
    ) -> Result<AnalysisBuild> {
        let covariate_names = renamed_covariates(&self.config.covariate_columns, &self.panel_columns())?;

        let (merged, unmatched_rows) = merge_covariates(panel, covariates, self.config.covariate_columns.len());
        if unmatched_rows > 0 {
            warn!("{} panel rows have no covariate record", unmatched_rows);
        }

        let imputed = impute_state_means(merged);
        let analysis = backfill_treated(imputed);

        let treated_change_sum = treated_change_sum(&analysis);
        if treated_change_sum != 0.0 {
            if self.config.strict_sanity_check {
                bail!(
                    "treated indicator changes within units (sum of first differences = {})",
                    treated_change_sum
                );
            }
            warn!(
                "treated indicator changes within units (sum of first differences = {})",
                treated_change_sum
            );
        } else {
            info!("treated indicator is constant within every unit");
        }

        let outcomes = self.outcome_positions();
        let clean = require_outcomes(analysis, &outcomes);
        let ultra_clean = require_complete_covariates(&clean);
        info!(
            "{} rows with complete outcomes, {} also with complete covariates",
            clean.len(),
            ultra_clean.len()
        );

        Ok(AnalysisBuild {
            covariate_names,
            clean,
            ultra_clean,
            unmatched_rows,
            treated_change_sum,
        })
    }

    /// Column names of the aggregated panel, in output order.
    pub fn panel_columns(&self) -> Vec<String> {
        META_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.config.aggregate_columns.iter().map(|c| aggregated_name(c)))
            .collect()
    }

    fn outcome_positions(&self) -> Vec<usize> {
        self.config
            .outcome_columns
            .iter()
            .filter_map(|o| self.config.aggregate_columns.iter().position(|c| c == o))
            .collect()
    }
}

/// `treatment = 1` once the calendar year reaches the treatment-start year.
pub fn label_treatment(observations: Vec<Observation>) -> Vec<Observation> {
    observations
        .into_iter()
        .map(|mut obs| {
            obs.treatment = match obs.chc_year_exp {
                Some(start) if obs.cyear as f64 >= start => 1,
                _ => 0,
            };
            obs
        })
        .collect()
}

pub fn restrict_to_sample(observations: Vec<Observation>, policy: &PeriodPolicy) -> Vec<Observation> {
    observations
        .into_iter()
        .filter(|obs| policy.in_sample(obs.cyear))
        .collect()
}

/// Remove every observation of units seen with `exp2 == 0` inside the
/// exclusion window. Returns the kept observations and the sorted excluded fips.
pub fn exclude_late_units(
    observations: Vec<Observation>,
    policy: &PeriodPolicy,
) -> (Vec<Observation>, Vec<u32>) {
    let excluded: HashSet<u32> = observations
        .iter()
        .filter(|obs| obs.exp2 == Some(0.0) && policy.in_exclusion_window(obs.cyear))
        .map(|obs| obs.fips)
        .collect();

    let kept = observations
        .into_iter()
        .filter(|obs| !excluded.contains(&obs.fips))
        .collect();

    let mut excluded: Vec<u32> = excluded.into_iter().collect();
    excluded.sort_unstable();
    (kept, excluded)
}

/// First difference of `treatment` within each unit ordered by year.
/// The first observation of a unit gets 0. Input order is preserved.
pub fn mark_status_changes(mut observations: Vec<Observation>) -> Vec<Observation> {
    let mut order: Vec<usize> = (0..observations.len()).collect();
    order.sort_by_key(|&i| (observations[i].fips, observations[i].cyear));

    let mut previous: Option<(u32, u8)> = None;
    for i in order {
        let obs = &mut observations[i];
        obs.change = match previous {
            Some((fips, treatment)) if fips == obs.fips => obs.treatment as f64 - treatment as f64,
            _ => 0.0,
        };
        previous = Some((obs.fips, obs.treatment));
    }
    observations
}

/// Share of observations switching into treatment per calendar year, with
/// its running total.
pub fn adoption_by_year(observations: &[Observation]) -> Vec<AdoptionYear> {
    let mut by_year: BTreeMap<i32, (usize, f64)> = BTreeMap::new();
    for obs in observations {
        let entry = by_year.entry(obs.cyear).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += obs.change;
    }

    let mut cumulative = 0.0;
    by_year
        .into_iter()
        .map(|(cyear, (units, switched))| {
            let fraction = switched / units as f64;
            cumulative += fraction;
            AdoptionYear {
                cyear,
                units,
                switched,
                fraction,
                cumulative,
            }
        })
        .collect()
}

pub fn assign_periods(observations: Vec<Observation>, policy: &PeriodPolicy) -> Vec<Observation> {
    observations
        .into_iter()
        .map(|mut obs| {
            obs.period = policy.classify(obs.cyear);
            obs
        })
        .collect()
}

/// Mean of the present values; `None` when every value is missing.
pub fn mean_skip_missing<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Average every declared column within (fips, period), drop the transition
/// window and keep one row per group. Identifier fields come from the first
/// observation of the group in input order. Rows are sorted by fips, period.
pub fn aggregate_panel(observations: &[Observation]) -> Vec<PanelRow> {
    let mut groups: HashMap<(u32, Period), Vec<&Observation>> = HashMap::new();
    let mut first_seen: Vec<(u32, Period)> = Vec::new();

    for obs in observations.iter().filter(|o| o.period != Period::Transition) {
        let key = (obs.fips, obs.period);
        groups
            .entry(key)
            .or_insert_with(|| {
                first_seen.push(key);
                Vec::new()
            })
            .push(obs);
    }

    let mut panel: Vec<PanelRow> = first_seen
        .into_iter()
        .map(|key| {
            let members = &groups[&key];
            let first = members[0];
            let aggregated = (0..first.values.len())
                .map(|col| mean_skip_missing(members.iter().map(|o| o.values[col])))
                .collect();
            PanelRow {
                fips: first.fips,
                stfips: first.stfips,
                cofips: first.cofips,
                year: first.year.clone(),
                cyear: first.cyear,
                treatment: first.treatment,
                change: first.change,
                period: first.period,
                aggregated,
            }
        })
        .collect();

    panel.sort_by_key(|row| (row.fips, row.period.code()));
    panel
}

/// Missing-value count per panel column, in panel column order.
pub fn null_counts(panel: &[PanelRow], columns: &[String]) -> Vec<(String, usize)> {
    columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let missing = if i < META_COLUMNS.len() {
                // identifiers are validated on load, only `year` can be blank
                if name == "year" {
                    panel.iter().filter(|r| r.year.is_empty()).count()
                } else {
                    0
                }
            } else {
                let col = i - META_COLUMNS.len();
                panel.iter().filter(|r| r.aggregated[col].is_none()).count()
            };
            (name.clone(), missing)
        })
        .collect()
}

/// Left join on (stfips, cofips). Unmatched rows get all-missing covariates.
/// `treated` starts out equal to `treatment`.
pub fn merge_covariates(
    panel: &[PanelRow],
    covariates: &[CovariateRecord],
    covariate_count: usize,
) -> (Vec<AnalysisRow>, usize) {
    let lookup: HashMap<(u32, u32), &CovariateRecord> = covariates
        .iter()
        .map(|c| ((c.stfips, c.cofips), c))
        .collect();

    let mut unmatched = 0;
    let rows = panel
        .iter()
        .map(|row| {
            let covariates = match lookup.get(&(row.stfips, row.cofips)) {
                Some(record) => record.values.clone(),
                None => {
                    unmatched += 1;
                    vec![None; covariate_count]
                }
            };
            AnalysisRow {
                panel: row.clone(),
                covariates,
                treated: row.treatment,
            }
        })
        .collect();
    (rows, unmatched)
}

/// Fill missing covariates with the mean of that covariate over all rows of
/// the same state. A state with no values at all stays missing.
pub fn impute_state_means(mut rows: Vec<AnalysisRow>) -> Vec<AnalysisRow> {
    let width = rows.first().map_or(0, |r| r.covariates.len());

    let mut state_rows: HashMap<u32, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        state_rows.entry(row.panel.stfips).or_default().push(i);
    }

    for members in state_rows.values() {
        for col in 0..width {
            let fill = mean_skip_missing(members.iter().map(|&i| rows[i].covariates[col]));
            if fill.is_none() {
                continue;
            }
            for &i in members {
                let value = &mut rows[i].covariates[col];
                if value.is_none() {
                    *value = fill;
                }
            }
        }
    }
    rows
}

/// Pre-period rows of units treated in any row are marked treated.
pub fn backfill_treated(mut rows: Vec<AnalysisRow>) -> Vec<AnalysisRow> {
    let ever_treated: HashSet<u32> = rows
        .iter()
        .filter(|r| r.panel.treatment == 1)
        .map(|r| r.panel.fips)
        .collect();

    for row in rows.iter_mut() {
        if row.panel.period == Period::Pre && ever_treated.contains(&row.panel.fips) {
            row.treated = 1;
        }
    }
    rows
}

/// Sum over units of the first difference of `treated` ordered by period.
pub fn treated_change_sum(rows: &[AnalysisRow]) -> f64 {
    let mut by_unit: BTreeMap<u32, Vec<(i32, u8)>> = BTreeMap::new();
    for row in rows {
        by_unit
            .entry(row.panel.fips)
            .or_default()
            .push((row.panel.period.code(), row.treated));
    }

    by_unit
        .into_values()
        .map(|mut periods| {
            periods.sort_by_key(|&(period, _)| period);
            periods
                .windows(2)
                .map(|w| w[1].1 as f64 - w[0].1 as f64)
                .sum::<f64>()
        })
        .sum()
}

/// Drop a single leading underscore.
pub fn strip_leading_underscore(name: &str) -> &str {
    name.strip_prefix('_').unwrap_or(name)
}

/// Output names of the covariates. Fails if a renamed covariate would clash
/// with a panel column or another covariate.
pub fn renamed_covariates(covariates: &[String], panel_columns: &[String]) -> Result<Vec<String>> {
    let mut taken: HashMap<String, String> = panel_columns
        .iter()
        .map(|c| (c.clone(), c.clone()))
        .collect();
    taken.insert("treated".to_string(), "treated".to_string());

    let mut renamed = Vec::with_capacity(covariates.len());
    for original in covariates {
        let name = strip_leading_underscore(original).to_string();
        if let Some(other) = taken.get(&name) {
            bail!("covariate `{}` renamed to `{}` clashes with `{}`", original, name, other);
        }
        taken.insert(name.clone(), original.clone());
        renamed.push(name);
    }
    Ok(renamed)
}

/// Keep rows whose aggregated outcomes at `outcome_positions` are all present.
pub fn require_outcomes(rows: Vec<AnalysisRow>, outcome_positions: &[usize]) -> Vec<AnalysisRow> {
    rows.into_iter()
        .filter(|row| {
            outcome_positions
                .iter()
                .all(|&i| row.panel.aggregated[i].is_some())
        })
        .collect()
}

pub fn require_complete_covariates(rows: &[AnalysisRow]) -> Vec<AnalysisRow> {
    rows.iter()
        .filter(|row| row.covariates.iter().all(Option::is_some))
        .cloned()
        .collect()
}

/// Covariate names joined for a `y ~ x1 + x2` style formula.
pub fn covariate_formula(names: &[String]) -> String {
    names.join(" + ")
}

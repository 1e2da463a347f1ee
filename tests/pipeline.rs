// End-to-end run over small panel and covariate fixtures

#[cfg(test)]
mod tests {
    use county_panel::models::{Config, OutputFiles};
    use county_panel::pipeline;
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const PANEL: &str = "\
fips,stfips,cofips,year,chc_year_exp,exp2,amr,amr_eld,notes
1001,1,1,1958-01-01,1968,,1000,1000,outside
1001,1,1,1960-01-01,1968,,10,100,a
1001,1,1,1961-01-01,1968,,20,200,b
1001,1,1,1970-01-01,1968,,99,990,transition
1001,1,1,1976-01-01,1968,1,30,300,c
1001,1,1,1985-01-01,1968,1,1000,1000,outside
1003,1,3,1962-01-01,,,5,50,
1003,1,3,1977-01-01,,1,6,60,
1005,1,5,1960-01-01,1979,,7,70,
1005,1,5,1978-01-01,1979,0,8,80,late
2001,2,1,1963-01-01,,,9,90,
2001,2,1,1979-01-01,,1,11,,
";

    const COVARIATES: &str = "\
stfips,cofips,_urban,rural
1,1,5,0.2
1,3,,0.4
1,5,7,0.1
";

    fn setup() -> (TempDir, Config) {
        let tmp = tempdir().unwrap();
        let panel = tmp.path().join("panel.csv");
        let covariates = tmp.path().join("ps.csv");
        fs::write(&panel, PANEL).unwrap();
        fs::write(&covariates, COVARIATES).unwrap();

        let config = Config {
            panel_file: panel.display().to_string(),
            covariate_file: covariates.display().to_string(),
            output_directory: Some(tmp.path().join("out").display().to_string()),
            aggregate_columns: vec!["amr".to_string(), "amr_eld".to_string()],
            outcome_columns: vec!["amr".to_string(), "amr_eld".to_string()],
            covariate_columns: vec!["_urban".to_string(), "rural".to_string()],
            strict_sanity_check: true,
            outputs: OutputFiles::default(),
        };
        (tmp, config)
    }

    struct Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    }

    impl Table {
        fn read(path: &Path) -> Self {
            let mut reader = csv::Reader::from_path(path).unwrap();
            let headers = reader.headers().unwrap().iter().map(String::from).collect();
            let rows = reader
                .records()
                .map(|r| r.unwrap().iter().map(String::from).collect())
                .collect();
            Self { headers, rows }
        }

        fn column(&self, name: &str) -> Vec<&str> {
            let i = self.headers.iter().position(|h| h == name).unwrap();
            self.rows.iter().map(|r| r[i].as_str()).collect()
        }

        fn find(&self, fips: &str, period: &str) -> Option<&Vec<String>> {
            let f = self.headers.iter().position(|h| h == "fips").unwrap();
            let p = self.headers.iter().position(|h| h == "period").unwrap();
            self.rows.iter().find(|r| r[f] == fips && r[p] == period)
        }

        fn value(&self, fips: &str, period: &str, column: &str) -> String {
            let i = self.headers.iter().position(|h| h == column).unwrap();
            self.find(fips, period).unwrap()[i].clone()
        }
    }

    #[test]
    fn test_panel_output() {
        let (tmp, config) = setup();
        let summary = pipeline::run(&config).unwrap();
        let out = tmp.path().join("out");

        let panel = Table::read(&out.join(&config.outputs.panel));
        assert_eq!(
            panel.headers,
            vec![
                "fips", "stfips", "cofips", "year", "cyear", "treatment", "change", "period",
                "amr_agg", "amr_eld_agg"
            ]
        );
        assert_eq!(panel.rows.len(), 6);
        assert_eq!(summary.panel_rows, 6);
        assert_eq!(summary.excluded_units, 1);

        // only pre and post survive, one row per unit and period
        assert!(panel.column("period").iter().all(|p| *p == "0" || *p == "1"));
        let keys: HashSet<(&str, &str)> = panel
            .column("fips")
            .into_iter()
            .zip(panel.column("period"))
            .collect();
        assert_eq!(keys.len(), panel.rows.len());

        // late-exposed unit is gone with all of its years
        assert!(!panel.column("fips").contains(&"1005"));

        assert_eq!(panel.value("1001", "0", "amr_agg"), "15");
        assert_eq!(panel.value("1001", "1", "amr_agg"), "30");
        assert_eq!(panel.value("1001", "0", "cyear"), "1960");
        assert_eq!(panel.value("1001", "0", "treatment"), "0");
        assert_eq!(panel.value("1001", "1", "treatment"), "1");
        assert_eq!(panel.value("2001", "1", "amr_eld_agg"), "");

        let nulls = fs::read_to_string(out.join(&config.outputs.panel_nulls)).unwrap();
        assert!(nulls.contains("amr_eld_agg,1\n"));
        assert!(nulls.contains("amr_agg,0\n"));
    }

    #[test]
    fn test_clean_outputs() {
        let (tmp, config) = setup();
        let summary = pipeline::run(&config).unwrap();
        let out = tmp.path().join("out");

        let clean = Table::read(&out.join(&config.outputs.clean));
        assert_eq!(clean.headers.len(), 13);
        assert_eq!(&clean.headers[10..], &["urban", "rural", "treated"]);
        assert_eq!(clean.rows.len(), 5);
        assert_eq!(summary.clean_rows, 5);
        assert!(clean.find("2001", "1").is_none());
        assert!(!clean.column("fips").contains(&"1005"));

        // ever-treated unit is treated in both periods
        assert_eq!(clean.value("1001", "0", "treated"), "1");
        assert_eq!(clean.value("1001", "1", "treated"), "1");
        assert_eq!(clean.value("1003", "0", "treated"), "0");
        assert_eq!(summary.treated_change_sum, 0.0);

        // state mean fill, and a state with no values stays missing
        assert_eq!(clean.value("1003", "0", "urban"), "5");
        assert_eq!(clean.value("1003", "1", "rural"), "0.4");
        assert_eq!(clean.value("2001", "0", "urban"), "");
        assert_eq!(summary.unmatched_rows, 2);

        let ultra = Table::read(&out.join(&config.outputs.ultra_clean));
        assert_eq!(ultra.headers, clean.headers);
        assert_eq!(ultra.rows.len(), 4);
        assert_eq!(summary.ultra_clean_rows, 4);
        assert!(!ultra.column("fips").contains(&"2001"));

        let formula = fs::read_to_string(out.join(&config.outputs.formula)).unwrap();
        assert_eq!(formula.trim(), "urban + rural");
        assert_eq!(summary.formula, "urban + rural");
    }

    #[test]
    fn test_adoption_output() {
        let (tmp, config) = setup();
        let summary = pipeline::run(&config).unwrap();

        let adoption = Table::read(&tmp.path().join("out").join(&config.outputs.adoption));
        assert_eq!(adoption.rows.len(), summary.adoption.len());
        let years = adoption.column("cyear");
        assert!(years.windows(2).all(|w| w[0] < w[1]));

        // 1001 switches in 1970; first row of each unit counts as no change
        let switched: f64 = summary.adoption.iter().map(|y| y.switched).sum();
        assert_eq!(switched, 1.0);
        let y1970 = summary.adoption.iter().find(|y| y.cyear == 1970).unwrap();
        assert_eq!(y1970.units, 1);
        assert_eq!(y1970.fraction, 1.0);
        assert_eq!(summary.adoption.last().unwrap().cumulative, 1.0);
    }

    #[test]
    fn test_missing_declared_column_fails() {
        let (_tmp, mut config) = setup();
        config.aggregate_columns.push("copop".to_string());
        let err = pipeline::run(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("copop"));
    }

    #[test]
    fn test_invalid_config_fails_before_reading() {
        let (_tmp, mut config) = setup();
        config.panel_file = "does-not-exist.csv".to_string();
        config.outcome_columns = vec!["copop".to_string()];
        let err = pipeline::run(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid configuration"));
    }
}

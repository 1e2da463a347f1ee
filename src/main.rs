use anyhow::Result;
use clap::{Arg, Command};
use county_panel::pipeline::{self, RunSummary};
use county_panel::report::{print_adoption, print_null_counts};
use county_panel::Config;
use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env).with_target(false).init();

    let matches = Command::new("county-panel")
        .version("0.1")
        .about("Builds a two-period pre/post county panel with imputed covariates")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .get_matches();

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");

    // Load or create configuration
    let config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        Config::default().save_to_file(config_file)?;
        println!(
            "⚠️  Please check the input paths and column lists in {}, then run the program again.",
            config_file
        );
        return Ok(());
    };

    println!("📂 Panel data: {}", config.panel_file);
    println!("📂 Covariate data: {}", config.covariate_file);
    println!("📊 Aggregated columns: {}", config.aggregate_columns.join(", "));
    println!("🎯 Required outcomes: {}", config.outcome_columns.join(", "));

    let summary = pipeline::run(&config)?;
    print_summary(&config, &summary);
    Ok(())
}

fn print_summary(config: &Config, summary: &RunSummary) {
    print_adoption(&summary.adoption);
    print_null_counts(&summary.null_counts);

    println!("\n📊 SUMMARY");
    println!("==========\n");
    println!("🚫 Units excluded (unexposed in the tail window): {}", summary.excluded_units);
    println!("🧮 County-period rows in the panel: {}", summary.panel_rows);
    if summary.unmatched_rows > 0 {
        println!("❓ Panel rows without a covariate record: {}", summary.unmatched_rows);
    }
    if summary.treated_change_sum == 0.0 {
        println!("✅ Treated indicator check: 0");
    } else {
        println!(
            "⚠️  Treated indicator check: {} (expected 0)",
            summary.treated_change_sum
        );
    }
    println!("🧹 Clean rows: {}", summary.clean_rows);
    println!("🧼 Ultra-clean rows: {}", summary.ultra_clean_rows);

    println!("\n🔤 Covariate formula:");
    println!("{}", summary.formula);

    println!("\n✅ Processing complete!");
    println!("📂 Results: {}", summary.output_dir.display());
    println!("   - {}", config.outputs.panel);
    println!("   - {}", config.outputs.panel_nulls);
    println!("   - {}", config.outputs.clean);
    println!("   - {} (not used downstream)", config.outputs.ultra_clean);
    println!("   - {}", config.outputs.adoption);
    println!("   - {}", config.outputs.formula);
}

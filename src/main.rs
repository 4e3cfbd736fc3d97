//! nbseq command-line interface

use clap::Parser;
use log::{info, LevelFilter};
use ndarray::Array1;

use nbseq::cli::{Cli, Commands, DesignArgs};
use nbseq::prelude::*;

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    if cli.threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(cli.threads).build_global() {
            log::warn!("Could not configure {} threads: {}", cli.threads, e);
        }
    }

    let result = match cli.command {
        Commands::Run {
            counts,
            design,
            numerator,
            denominator,
            term,
            coef,
            output,
            summary,
            config,
            alpha,
            fit_type,
            sf_type,
            shrink,
            lfc_threshold,
            alt_hypothesis,
            use_t,
            no_independent_filtering,
            cooks_cutoff,
            no_cooks,
        } => (|| {
            let mut config = load_config(config.as_deref())?;
            if let Some(alpha) = alpha {
                config.alpha = alpha;
            }
            if let Some(fit_type) = fit_type {
                config.fit_type = fit_type.parse()?;
            }
            if let Some(sf_type) = sf_type {
                config.size_factor_method = sf_type.parse()?;
            }
            if let Some(threshold) = lfc_threshold {
                config.lfc_threshold = threshold;
            }
            if let Some(alt) = alt_hypothesis {
                config.alt_hypothesis = alt.parse()?;
            }
            if let Some(cutoff) = cooks_cutoff {
                config.cooks_cutoff = Some(cutoff);
            }
            config.shrink_lfc |= shrink;
            config.use_t |= use_t;
            config.independent_filtering &= !no_independent_filtering;
            config.cooks_filter &= !no_cooks;

            let contrast = match (coef, numerator, denominator) {
                (Some(name), _, _) => Contrast::Coefficient(name),
                (None, Some(numerator), Some(denominator)) => {
                    let spec = parse_design(&design)?;
                    let term = term
                        .or_else(|| spec.terms().last().cloned())
                        .ok_or_else(|| NbseqError::InvalidContrast {
                            reason: "the design has no term to compare levels of".to_string(),
                        })?;
                    Contrast::Levels {
                        term,
                        numerator,
                        denominator,
                    }
                }
                _ => Contrast::Default,
            };
            run_analysis(&counts, &design, config, &contrast, &output, summary.as_deref())
        })(),
        Commands::Normalize {
            counts,
            output,
            sf_type,
            summary,
        } => run_normalize(&counts, &output, &sf_type, summary.as_deref()),
        Commands::Vst {
            counts,
            design,
            output,
            fit_type,
            aware,
            config,
        } => (|| {
            let mut config = load_config(config.as_deref())?;
            if let Some(fit_type) = fit_type {
                config.fit_type = fit_type.parse()?;
            }
            run_vst(&counts, &design, config, &output, !aware)
        })(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            AnalysisConfig::from_json_file(path)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

/// `~ a + b` formula, or a bare column name as a one-term design
fn parse_design(args: &DesignArgs) -> Result<DesignSpec> {
    let mut spec = if args.design.trim_start().starts_with('~') {
        DesignSpec::parse(&args.design)?
    } else {
        DesignSpec::new([args.design.trim()])
    };
    for entry in &args.reference {
        let (factor, level) = entry.split_once('=').ok_or_else(|| NbseqError::InvalidDesign {
            reason: format!("reference '{}' must have the form factor=level", entry),
        })?;
        spec = spec.with_reference(factor.trim(), level.trim());
    }
    Ok(spec)
}

fn load_state(counts_path: &str, args: &DesignArgs, mut config: AnalysisConfig) -> Result<AnalysisState> {
    if let Some(policy) = &args.reference_policy {
        config.reference_policy = policy.parse()?;
    }
    config.validate()?;

    info!("Loading count matrix from: {}", counts_path);
    let counts = read_count_matrix(counts_path)?;
    info!("Loading metadata from: {}", args.metadata);
    let metadata = read_metadata(&args.metadata, &args.continuous)?;
    let spec = parse_design(args)?;
    AnalysisState::new(counts, metadata, &spec, config)
}

fn run_analysis(
    counts_path: &str,
    design: &DesignArgs,
    config: AnalysisConfig,
    contrast: &Contrast,
    output_path: &str,
    summary_path: Option<&str>,
) -> Result<()> {
    let state = load_state(counts_path, design, config)?.run()?;
    let results = state.results(contrast)?;

    write_results(output_path, &results)?;
    info!("Results written to: {}", output_path);
    if let Some(path) = summary_path {
        write_json(path, &state.summary(Some(&results)))?;
        info!("Summary written to: {}", path);
    }

    println!();
    print!("{}", results.summary());
    Ok(())
}

fn run_normalize(counts_path: &str, output_path: &str, sf_type: &str, summary_path: Option<&str>) -> Result<()> {
    info!("Loading count matrix from: {}", counts_path);
    let counts = read_count_matrix(counts_path)?;
    let size_factors: Array1<f64> = estimate_size_factors(counts.counts(), sf_type.parse()?)?;
    let normalized = normalized_counts(counts.counts(), &size_factors);

    write_matrix(output_path, counts.gene_ids(), counts.sample_ids(), &normalized)?;
    info!("Normalized counts written to: {}", output_path);

    if let Some(path) = summary_path {
        let summary = serde_json::json!({
            "sample_ids": counts.sample_ids(),
            "size_factors": size_factors.to_vec(),
        });
        write_json(path, &summary)?;
        info!("Size factors written to: {}", path);
    }
    Ok(())
}

fn run_vst(counts_path: &str, design: &DesignArgs, config: AnalysisConfig, output_path: &str, blind: bool) -> Result<()> {
    let state = load_state(counts_path, design, config)?.estimate_size_factors()?;
    let state = if blind { state } else { state.estimate_dispersions()? };
    let transformed = state.vst(blind)?;

    write_matrix(
        output_path,
        state.counts().gene_ids(),
        state.counts().sample_ids(),
        &transformed,
    )?;
    info!("Transformed values written to: {}", output_path);
    Ok(())
}

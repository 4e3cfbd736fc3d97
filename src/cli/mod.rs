//! Command-line interface for nbseq

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nbseq")]
#[command(version)]
#[command(about = "Negative binomial differential expression analysis of RNA-seq counts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Number of worker threads (0 = all cores)
    #[arg(short = 't', long, global = true, default_value = "0")]
    pub threads: usize,
}

/// Inputs shared by the subcommands that need a design
#[derive(Args, Debug, Clone)]
pub struct DesignArgs {
    /// Path to the sample metadata table
    #[arg(short, long,
        long_help = "Path to the sample metadata table (CSV or TSV).\n\
            First column = sample IDs, in the same order as the count matrix columns;\n\
            remaining columns = covariates.")]
    pub metadata: String,

    /// Design formula or a single variable
    #[arg(short, long,
        long_help = "Design as an additive formula (\"~ batch + condition\") or a single\n\
            metadata column. The last term is the tested effect by default.")]
    pub design: String,

    /// Metadata column to treat as continuous
    #[arg(long, value_name = "VAR")]
    pub continuous: Vec<String>,

    /// Reference level (format: factor=level)
    #[arg(long, value_name = "FACTOR=LEVEL",
        long_help = "Reference level for a factor, e.g. --reference condition=control.\n\
            Without it the reference follows --reference-policy.")]
    pub reference: Vec<String>,

    /// Reference level policy: lexicographic or first-observed
    #[arg(long)]
    pub reference_policy: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full differential expression analysis
    #[command(
        long_about = "Run the full analysis\n\n\
            Size factors, dispersion estimation with shrinkage toward the trend,\n\
            negative binomial GLM fits, Wald tests, independent filtering and\n\
            Cook's distance outlier flags.",
        after_long_help = "\
Examples:
  nbseq run -c counts.tsv -m samples.tsv -d condition -o results.tsv

  nbseq run -c counts.tsv -m samples.tsv -d \"~ batch + condition\" \\
    --numerator treated --denominator control --shrink

  nbseq run -c counts.tsv -m samples.tsv -d condition --config run.json --summary run_summary.json"
    )]
    Run {
        /// Path to the count matrix (genes x samples)
        #[arg(short, long)]
        counts: String,

        #[command(flatten)]
        design: DesignArgs,

        /// Numerator level of the tested term
        #[arg(long, requires = "denominator")]
        numerator: Option<String>,

        /// Denominator level of the tested term
        #[arg(long, requires = "numerator")]
        denominator: Option<String>,

        /// Term for --numerator/--denominator [default: last design term]
        #[arg(long)]
        term: Option<String>,

        /// Test a single coefficient by name
        #[arg(long, conflicts_with_all = ["numerator", "denominator"])]
        coef: Option<String>,

        /// Output results table
        #[arg(short, long, default_value = "nbseq_results.tsv")]
        output: String,

        /// JSON summary of size factors, dispersion trend and counts
        #[arg(long)]
        summary: Option<String>,

        /// JSON configuration file; command-line options override it
        #[arg(long)]
        config: Option<String>,

        /// Target false discovery rate
        #[arg(short, long)]
        alpha: Option<f64>,

        /// Dispersion trend: parametric, local or mean
        #[arg(long)]
        fit_type: Option<String>,

        /// Size factor method: ratio or poscounts
        #[arg(long)]
        sf_type: Option<String>,

        /// Shrink log2 fold changes with a normal prior
        #[arg(long)]
        shrink: bool,

        /// Log2 fold change threshold of the alternative hypothesis
        #[arg(long)]
        lfc_threshold: Option<f64>,

        /// Alternative hypothesis: greaterAbs, lessAbs, greater or less
        #[arg(long)]
        alt_hypothesis: Option<String>,

        /// Student's t p-values with m - p degrees of freedom
        #[arg(long)]
        use_t: bool,

        /// Apply BH to all genes without independent filtering
        #[arg(long)]
        no_independent_filtering: bool,

        /// Cook's distance cutoff [default: 0.99 quantile of F(p, m - p)]
        #[arg(long)]
        cooks_cutoff: Option<f64>,

        /// Do not flag Cook's distance outliers
        #[arg(long, conflicts_with = "cooks_cutoff")]
        no_cooks: bool,
    },

    /// Estimate size factors and write normalized counts
    #[command(after_long_help = "\
Examples:
  nbseq normalize -c counts.tsv -o normalized.tsv
  nbseq normalize -c counts.tsv -o normalized.tsv --sf-type poscounts --summary sf.json")]
    Normalize {
        /// Path to the count matrix (genes x samples)
        #[arg(short, long)]
        counts: String,

        /// Output normalized matrix
        #[arg(short, long)]
        output: String,

        /// Size factor method: ratio or poscounts
        #[arg(long, default_value = "ratio")]
        sf_type: String,

        /// JSON file receiving the size factors
        #[arg(long)]
        summary: Option<String>,
    },

    /// Variance stabilizing transformation
    #[command(
        long_about = "Variance stabilizing transformation\n\n\
            Transforms normalized counts with the fitted dispersion trend so that\n\
            the variance no longer depends on the mean. Values approach log2 of\n\
            the normalized counts for large counts.",
        after_long_help = "\
Examples:
  nbseq vst -c counts.tsv -m samples.tsv -d condition -o vst.tsv
  nbseq vst -c counts.tsv -m samples.tsv -d condition --aware --fit-type local"
    )]
    Vst {
        /// Path to the count matrix (genes x samples)
        #[arg(short, long)]
        counts: String,

        #[command(flatten)]
        design: DesignArgs,

        /// Output transformed matrix
        #[arg(short, long, default_value = "nbseq_vst.tsv")]
        output: String,

        /// Dispersion trend: parametric, local or mean
        #[arg(long)]
        fit_type: Option<String>,

        /// Use the design when estimating the trend instead of an intercept-only model
        #[arg(long)]
        aware: bool,

        /// JSON configuration file
        #[arg(long)]
        config: Option<String>,
    },
}

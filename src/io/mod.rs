//! Reading inputs and writing tables and summaries

mod csv;
mod results;
mod summary;

pub use self::csv::{detect_delimiter, read_count_matrix, read_metadata, write_json, write_matrix, write_results};
pub use results::{GeneResult, GeneStatus, ResultsSummary, ResultsTable, SortKey};
pub use summary::AnalysisSummary;

//! Delimited text input and output
//!
//! Tables are tab or comma separated. The delimiter follows the file
//! extension (`.csv` or `.tsv`/`.tab`/`.txt`), falling back to sniffing the
//! header line.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use ::csv::{ReaderBuilder, StringRecord, WriterBuilder};
use ndarray::Array2;

use super::results::ResultsTable;
use crate::data::{CountMatrix, SampleMetadata};
use crate::error::{NbseqError, Result};

/// Delimiter for `path`, by extension or else by the first line
pub fn detect_delimiter(path: &Path) -> Result<u8> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("csv") => return Ok(b','),
        Some("tsv") | Some("tab") => return Ok(b'\t'),
        _ => {}
    }

    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

fn open_reader(path: &Path) -> Result<::csv::Reader<File>> {
    let delimiter = detect_delimiter(path)?;
    Ok(ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(::csv::Trim::All)
        .from_path(path)?)
}

fn header_fields(headers: &StringRecord, what: &str) -> Result<Vec<String>> {
    if headers.len() < 2 {
        return Err(NbseqError::EmptyData {
            reason: format!("{} header needs an identifier column and at least one more column", what),
        });
    }
    Ok(headers.iter().skip(1).map(|s| s.to_string()).collect())
}

/// Read a count matrix: first column gene identifiers, header row sample
/// identifiers
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let sample_ids = header_fields(reader.headers()?, "count matrix")?;
    let n_samples = sample_ids.len();

    let mut gene_ids = Vec::new();
    let mut values = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != n_samples + 1 {
            return Err(NbseqError::InvalidCountMatrix {
                reason: format!(
                    "row {} has {} fields, expected {}",
                    line + 2,
                    record.len(),
                    n_samples + 1
                ),
            });
        }
        let gene = record.get(0).unwrap_or_default().to_string();
        for field in record.iter().skip(1) {
            let count = field.parse::<f64>().map_err(|_| NbseqError::InvalidCountMatrix {
                reason: format!("gene '{}': '{}' is not a count", gene, field),
            })?;
            values.push(count);
        }
        gene_ids.push(gene);
    }

    if gene_ids.is_empty() {
        return Err(NbseqError::EmptyData {
            reason: format!("no genes in {}", path.display()),
        });
    }
    let counts = Array2::from_shape_vec((gene_ids.len(), n_samples), values).map_err(|e| {
        NbseqError::InvalidCountMatrix {
            reason: e.to_string(),
        }
    })?;
    log::info!(
        "Read {} genes x {} samples from {}",
        gene_ids.len(),
        n_samples,
        path.display()
    );
    CountMatrix::new(counts, gene_ids, sample_ids)
}

/// Read sample metadata: first column sample identifiers, every other column
/// a categorical covariate unless named in `continuous`
pub fn read_metadata<P: AsRef<Path>>(path: P, continuous: &[String]) -> Result<SampleMetadata> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let columns = header_fields(reader.headers()?, "metadata")?;

    let mut sample_ids = Vec::new();
    let mut values: Vec<Vec<String>> = vec![Vec::new(); columns.len()];
    for record in reader.records() {
        let record = record?;
        if record.len() != columns.len() + 1 {
            return Err(NbseqError::InvalidMetadata {
                reason: format!(
                    "sample row has {} fields, expected {}",
                    record.len(),
                    columns.len() + 1
                ),
            });
        }
        sample_ids.push(record.get(0).unwrap_or_default().to_string());
        for (column, field) in values.iter_mut().zip(record.iter().skip(1)) {
            column.push(field.to_string());
        }
    }

    if sample_ids.is_empty() {
        return Err(NbseqError::EmptyData {
            reason: format!("no samples in {}", path.display()),
        });
    }

    let mut metadata = SampleMetadata::new(sample_ids)?;
    for (name, column) in columns.iter().zip(values) {
        metadata.add_categorical(name, column)?;
        if continuous.contains(name) {
            metadata.set_continuous(name)?;
        }
    }
    for name in continuous {
        if !columns.contains(name) {
            return Err(NbseqError::InvalidMetadata {
                reason: format!("continuous column '{}' not found", name),
            });
        }
    }
    Ok(metadata)
}

/// Missing values are written as `NA`
fn format_value(x: f64) -> String {
    if x.is_nan() {
        "NA".to_string()
    } else {
        format!("{}", x)
    }
}

fn writer_for(path: &Path) -> Result<::csv::Writer<File>> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };
    Ok(WriterBuilder::new().delimiter(delimiter).from_path(path)?)
}

/// Write the results table, one row per gene in table order
pub fn write_results<P: AsRef<Path>>(path: P, results: &ResultsTable) -> Result<()> {
    let mut writer = writer_for(path.as_ref())?;
    writer.write_record([
        "gene_id",
        "baseMean",
        "baseVar",
        "log2FoldChange",
        "lfcSE",
        "stat",
        "pvalue",
        "padj",
        "dispersion",
        "dispGeneEst",
        "dispFit",
        "maxCooks",
        "status",
    ])?;
    for row in results.rows() {
        let mut record = vec![row.gene_id.clone()];
        record.extend(
            [
                row.base_mean,
                row.base_var,
                row.log2_fold_change,
                row.lfc_se,
                row.stat,
                row.pvalue,
                row.padj,
                row.dispersion,
                row.gene_wise_dispersion,
                row.trended_dispersion,
                row.max_cooks,
            ]
            .iter()
            .map(|&x| format_value(x)),
        );
        record.push(row.status.to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a genes x samples matrix with identifier header and column
pub fn write_matrix<P: AsRef<Path>>(
    path: P,
    gene_ids: &[String],
    sample_ids: &[String],
    matrix: &Array2<f64>,
) -> Result<()> {
    if matrix.dim() != (gene_ids.len(), sample_ids.len()) {
        return Err(NbseqError::DimensionMismatch {
            expected: format!("{} x {}", gene_ids.len(), sample_ids.len()),
            got: format!("{} x {}", matrix.nrows(), matrix.ncols()),
        });
    }
    let mut writer = writer_for(path.as_ref())?;
    let mut header = vec!["gene_id".to_string()];
    header.extend(sample_ids.iter().cloned());
    writer.write_record(&header)?;
    for (gene, row) in gene_ids.iter().zip(matrix.rows()) {
        let mut record = vec![gene.clone()];
        record.extend(row.iter().map(|&x| format_value(x)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Serialize any summary value as pretty JSON
pub fn write_json<P: AsRef<Path>, T: serde::Serialize>(path: P, value: &T) -> Result<()> {
    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    writeln!(file)?;
    Ok(())
}

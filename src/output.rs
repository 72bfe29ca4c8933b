//! Plain text chain files.
//!
//! Every chain writes one file with a commented header row followed by
//! one whitespace separated row per committed sample:
//!
//! ```text
//! # weight minuslogpost a b derived_c minuslogprior loglike__gauss
//! 3 1.2345678900e0 ...
//! ```
//!
//! Rows are only ever appended. When a run is resumed the file is cut back
//! to the rows covered by the checkpoint, so the pending point of an
//! interrupted run is not duplicated.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::chain::ChainEntry;
use crate::posterior::Posterior;
use crate::settings::OutputSettings;

/// Path of the output file of chain `chain` (0-based, files are numbered from 1).
pub fn chain_path(settings: &OutputSettings, chain: u64) -> PathBuf {
    settings
        .dir
        .join(format!("{}.{}.txt", settings.prefix, chain + 1))
}

pub fn checkpoint_path(settings: &OutputSettings) -> PathBuf {
    settings
        .dir
        .join(format!("{}.checkpoint.json", settings.prefix))
}

/// Column names, fixed for the whole run.
pub fn columns(posterior: &Posterior) -> Vec<String> {
    let space = posterior.space();
    let mut columns = vec!["weight".to_string(), "minuslogpost".to_string()];
    columns.extend(space.sampled_names().map(str::to_string));
    columns.extend(space.derived_names().iter().cloned());
    columns.push("minuslogprior".to_string());
    columns.extend(
        posterior
            .likelihood_names()
            .map(|name| format!("loglike__{name}")),
    );
    columns
}

pub fn header(posterior: &Posterior) -> String {
    format!("# {}", columns(posterior).join(" "))
}

fn format_float(value: f64, precision: usize) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.precision$e}")
    }
}

pub fn format_row(entry: &ChainEntry, precision: usize) -> String {
    let point = &entry.point;
    let mut row = vec![
        entry.weight.to_string(),
        format_float(-point.log_posterior, precision),
    ];
    row.extend(point.values.iter().map(|&v| format_float(v, precision)));
    row.extend(
        point
            .derived
            .iter()
            .map(|v| format_float(v.unwrap_or(f64::NAN), precision)),
    );
    row.push(format_float(-point.log_prior, precision));
    row.extend(
        point
            .log_likelihoods
            .iter()
            .map(|&v| format_float(v, precision)),
    );
    row.join(" ")
}

/// Append-only writer for one chain file.
pub struct ChainWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    precision: usize,
    rows: usize,
}

impl ChainWriter {
    /// Create (or truncate) the file and write the header.
    pub fn create(path: &Path, header: &str, precision: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create chain file: {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{header}")?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            precision,
            rows: 0,
        })
    }

    /// Reopen an existing file, keeping only its first `rows` samples.
    pub fn resume(path: &Path, header: &str, precision: usize, rows: usize) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain file: {:?}", path))?;
        let mut lines = contents.lines();
        match lines.next() {
            Some(found) if found.trim_end() == header => {}
            Some(found) => bail!(
                "Columns of {:?} do not match the current parameters: {found}",
                path
            ),
            None => bail!("Chain file {:?} is empty", path),
        }
        let kept: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).take(rows).collect();
        if kept.len() < rows {
            bail!(
                "Chain file {:?} has {} rows but the checkpoint expects {rows}",
                path,
                kept.len()
            );
        }

        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
        writeln!(tmp, "{header}")?;
        for line in &kept {
            writeln!(tmp, "{line}")?;
        }
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace chain file: {:?}", path))?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open chain file: {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            precision,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sample rows in the file.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_entry(&mut self, entry: &ChainEntry) -> Result<()> {
        writeln!(self.writer, "{}", format_row(entry, self.precision))
            .with_context(|| format!("Failed to write to {:?}", self.path))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush chain file: {:?}", self.path))
    }
}

/// Read a chain file back as column names and numeric rows.
pub fn read_chain(path: &Path) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chain file: {:?}", path))?;
    let mut lines = contents.lines();
    let columns: Vec<String> = match lines.next().and_then(|l| l.strip_prefix('#')) {
        Some(header) => header.split_whitespace().map(str::to_string).collect(),
        None => bail!("Chain file {:?} has no header", path),
    };
    let rows = lines
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let row = line
                .split_whitespace()
                .map(|v| v.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("Invalid number in row {} of {:?}", i + 1, path))?;
            if row.len() != columns.len() {
                bail!("Row {} of {:?} has {} columns", i + 1, path, row.len());
            }
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{ParameterDef, ParameterSpace, Prior};
    use crate::posterior::{FnLikelihood, Point};
    use pretty_assertions::assert_eq;

    fn posterior() -> Posterior {
        let space = ParameterSpace::new([
            ParameterDef::sampled("a", Prior::Uniform { min: -1., max: 1. }),
            ParameterDef::derived("b"),
        ])
        .unwrap();
        Posterior::new(space, vec![Box::new(FnLikelihood::new("flat", |_: &[f64]| 0.))]).unwrap()
    }

    fn entry(a: f64, weight: u64) -> ChainEntry {
        ChainEntry {
            point: Point {
                values: vec![a],
                derived: vec![None],
                log_prior: -(2f64.ln()),
                log_likelihoods: vec![-0.5],
                log_posterior: -(2f64.ln()) - 0.5,
            },
            weight,
            step: 0,
        }
    }

    #[test]
    fn header_and_rows() {
        let post = posterior();
        assert_eq!(
            header(&post),
            "# weight minuslogpost a b minuslogprior loglike__flat"
        );
        assert_eq!(
            format_row(&entry(0.25, 3), 3),
            "3 1.193e0 2.500e-1 nan 6.931e-1 -5.000e-1"
        );
    }

    #[test]
    fn paths_are_numbered_from_one() {
        let settings = OutputSettings {
            dir: PathBuf::from("out"),
            prefix: "run".to_string(),
            precision: 4,
        };
        assert_eq!(chain_path(&settings, 0), PathBuf::from("out/run.1.txt"));
        assert_eq!(
            checkpoint_path(&settings),
            PathBuf::from("out/run.checkpoint.json")
        );
    }

    #[test]
    fn resume_truncates_to_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chain.1.txt");
        let post = posterior();
        let header = header(&post);

        let mut writer = ChainWriter::create(&path, &header, 6)?;
        for i in 0..5 {
            writer.write_entry(&entry(i as f64 / 10., i + 1))?;
        }
        writer.flush()?;
        drop(writer);

        let mut writer = ChainWriter::resume(&path, &header, 6, 3)?;
        assert_eq!(writer.rows(), 3);
        writer.write_entry(&entry(0.9, 7))?;
        writer.flush()?;

        let (columns, rows) = read_chain(&path)?;
        assert_eq!(columns.len(), 6);
        let weights: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        assert_eq!(weights, vec![1., 2., 3., 7.]);
        assert!(rows[0][3].is_nan());
        Ok(())
    }

    #[test]
    fn resume_checks_columns_and_length() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chain.1.txt");
        let post = posterior();
        let mut writer = ChainWriter::create(&path, &header(&post), 6)?;
        writer.write_entry(&entry(0.1, 1))?;
        writer.flush()?;
        drop(writer);

        assert!(ChainWriter::resume(&path, "# weight other", 6, 0).is_err());
        assert!(ChainWriter::resume(&path, &header(&post), 6, 2).is_err());
        Ok(())
    }
}

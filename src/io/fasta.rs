//! Minimal FASTA support, used to validate alignments against mappings and
//! to emit the orthogroup super-matrix.

use crate::errors::FileError;
use anyhow::Result;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub struct FastaRecord {
    pub label: String,
    pub sequence: String,
}

pub fn read_fasta(path: &Path) -> Result<Vec<FastaRecord>> {
    let file = File::open(path).map_err(|source| FileError::CannotOpen {
        source,
        filename: path.display().to_string(),
    })?;
    let mut records: Vec<FastaRecord> = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_prefix('>') {
            records.push(FastaRecord {
                label: label.split_whitespace().next().unwrap_or("").to_string(),
                sequence: String::new(),
            });
        } else if let Some(last) = records.last_mut() {
            last.sequence.push_str(line);
        } else {
            return Err(FileError::Empty(path.display().to_string()).into());
        }
    }
    if records.is_empty() {
        return Err(FileError::Empty(path.display().to_string()).into());
    }
    Ok(records)
}

pub fn write_fasta(records: &[(String, String)], path: &Path) -> Result<()> {
    let mut out = File::create(path).map_err(|source| FileError::WhileCreating {
        source,
        filename: path.display().to_string(),
    })?;
    for (label, sequence) in records {
        writeln!(out, ">{}", label)?;
        writeln!(out, "{}", sequence)?;
    }
    Ok(())
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Joins fields into one quoted record line: `"a","b","c"`.
pub fn quote_fields(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a quoted record line back into its fields. Quotes inside fields
/// are not supported; sample ids and paths never carry them.
pub fn parse_quoted_fields(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ if in_quotes => current.push(c),
            _ => {}
        }
    }
    if in_quotes {
        return Err(anyhow!("Unterminated quote in record: {}", line));
    }
    fields.push(current);
    Ok(fields)
}

/// Output path `<dir>/<sample_id>.<ext>` for a per-sample artifact.
pub fn sample_out_path(dir: &Path, sample_id: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", sample_id, ext))
}

/// True when `path` exists with a non-zero reported length. This is the
/// freshness check the execution cache uses; sparse-reclaimed files keep
/// their reported size and still pass it.
pub fn is_nonempty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Resolves a possibly-relative path against `cwd`.
pub fn absolutize(path: &str, cwd: &Path) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { cwd.join(p) }
}

/// Concatenates `inputs` into `output` in order. Used to merge multi-run
/// downloads and multi-file local samples into one per-sample FASTQ.
pub fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let mut out = fs::File::create(output)
        .map_err(|e| anyhow!("Cannot create {}: {}", output.display(), e))?;
    for input in inputs {
        let mut reader = fs::File::open(input)
            .map_err(|e| anyhow!("Cannot open {}: {}", input.display(), e))?;
        std::io::copy(&mut reader, &mut out)?;
    }
    Ok(())
}

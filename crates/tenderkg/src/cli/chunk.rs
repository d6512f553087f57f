use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tenderkg_core::chunk::{read_jsonl, write_jsonl};
use tenderkg_core::{Chunk, TenderRecord};
use tracing::warn;

pub fn run(records: &Path, output: &Path, source: &str) -> Result<()> {
    let file = File::open(records).with_context(|| format!("Cannot read {}", records.display()))?;
    let records: Vec<TenderRecord> = read_jsonl(BufReader::new(file))?;

    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for (idx, record) in records.iter().enumerate() {
        match Chunk::from_record(record, source) {
            Ok(chunk) if seen.insert(chunk.id.clone()) => chunks.push(chunk),
            Ok(chunk) => {
                warn!(chunk_id = %chunk.id, record = idx + 1, "Duplicate chunk id, keeping the first");
                skipped += 1;
            }
            Err(e) => {
                warn!(record = idx + 1, error = %e, "Skipping record");
                skipped += 1;
            }
        }
    }

    let file = File::create(output).with_context(|| format!("Cannot write {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    write_jsonl(&mut writer, &chunks)?;
    writer.flush()?;

    eprintln!(
        "Wrote {} chunks to {} ({skipped} skipped)",
        chunks.len(),
        output.display()
    );
    Ok(())
}

use console::style;
use std::path::Path;

use rlm_core::{ChunkDescriptor, Result};
use rlm_runtime::ContextBuffer;

use super::read_input;

pub(super) fn cmd_plan(path: &Path, chunk_size: usize, overlap: usize, json: bool) -> Result<()> {
    let context = ContextBuffer::new(read_input(path)?);
    let chunks = context.plan_chunks(chunk_size, overlap)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!(
        "{} {} characters, chunk_size {chunk_size}, overlap {overlap}: {} chunks",
        style("Plan").bold(),
        context.len(),
        chunks.len()
    );
    println!("{}", "-".repeat(48));
    for line in render_rows(&chunks) {
        println!("{line}");
    }
    Ok(())
}

fn render_rows(chunks: &[ChunkDescriptor]) -> Vec<String> {
    chunks
        .iter()
        .map(|c| format!("{:>5}  {:>10}  {:>10}  {:>8}", c.id, c.start, c.end, c.len()))
        .collect()
}

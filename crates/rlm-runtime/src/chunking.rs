use rlm_core::{ChunkDescriptor, Result, RlmError};

/// Plan chunk descriptors over a context of `length` characters.
///
/// Each chunk is at most `chunk_size` long; the next one starts `overlap`
/// characters before the previous one ended. Only the final chunk may be
/// shorter. An empty context yields no chunks.
pub fn plan_chunks(length: usize, chunk_size: usize, overlap: usize) -> Result<Vec<ChunkDescriptor>> {
    if chunk_size == 0 {
        return Err(RlmError::InvalidParameter(
            "chunk_size must be greater than 0".into(),
        ));
    }
    if overlap >= chunk_size {
        return Err(RlmError::InvalidParameter(format!(
            "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
        )));
    }

    let mut chunks = Vec::with_capacity(length.div_ceil(chunk_size - overlap));
    if length == 0 {
        return Ok(chunks);
    }

    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(length);
        chunks.push(ChunkDescriptor {
            id: chunks.len(),
            start,
            end,
        });
        if end == length {
            break;
        }
        start = end - overlap;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(chunks: &[ChunkDescriptor], length: usize) -> bool {
        let mut covered = vec![false; length];
        for c in chunks {
            for slot in &mut covered[c.start..c.end] {
                *slot = true;
            }
        }
        covered.into_iter().all(|c| c)
    }

    #[test]
    fn test_fifty_thousand_by_ten_thousand() {
        let chunks = plan_chunks(50_000, 10_000, 0).unwrap();
        assert_eq!(chunks.len(), 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, i);
            assert_eq!(c.start, i * 10_000);
            assert_eq!(c.end, (i + 1) * 10_000);
        }
    }

    #[test]
    fn test_short_final_chunk() {
        let chunks = plan_chunks(25, 10, 0).unwrap();
        let bounds: Vec<_> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(bounds, vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn test_overlap_steps_back() {
        let chunks = plan_chunks(20_000, 10_000, 20).unwrap();
        let bounds: Vec<_> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(bounds, vec![(0, 10_000), (9_980, 19_980), (19_960, 20_000)]);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start, pair[0].end - 20);
        }
    }

    #[test]
    fn test_invariants_over_parameter_grid() {
        for length in [0, 1, 7, 99, 100, 101, 1_000] {
            for chunk_size in [1, 3, 10, 100] {
                for overlap in [0, 1, 2] {
                    if overlap >= chunk_size {
                        continue;
                    }
                    let chunks = plan_chunks(length, chunk_size, overlap).unwrap();
                    assert!(covers(&chunks, length));
                    for (i, c) in chunks.iter().enumerate() {
                        assert_eq!(c.id, i);
                        assert!(c.len() <= chunk_size);
                        if i + 1 < chunks.len() {
                            assert_eq!(c.len(), chunk_size);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_chunk_larger_than_context() {
        let chunks = plan_chunks(5, 100, 10).unwrap();
        assert_eq!(chunks, vec![ChunkDescriptor { id: 0, start: 0, end: 5 }]);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(plan_chunks(10, 0, 0), Err(RlmError::InvalidParameter(_))));
        assert!(matches!(plan_chunks(10, 5, 5), Err(RlmError::InvalidParameter(_))));
        assert!(matches!(plan_chunks(10, 5, 6), Err(RlmError::InvalidParameter(_))));
    }
}

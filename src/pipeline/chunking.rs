use thiserror::Error;

use super::model::{Chunk, ChunkSet};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk size must be positive")]
    ZeroSize,
}

/// Split `text` into consecutive chunks of `size` chars; only the last may
/// be shorter. Concatenating the chunks in index order yields `text`.
pub fn chunk_text(source: &str, text: &str, size: usize) -> Result<ChunkSet, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    let chars: Vec<char> = text.chars().collect();
    let chunks = chars
        .chunks(size)
        .enumerate()
        .map(|(index, part)| Chunk {
            source: source.to_string(),
            index,
            text: part.iter().collect(),
            size: part.len(),
        })
        .collect();
    Ok(ChunkSet {
        source: source.to_string(),
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_with_short_tail() {
        let text = "abcdefghijklmnopqrstuvw";
        let set = chunk_text("m.wav", text, 10).unwrap();
        let sizes: Vec<usize> = set.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        let joined: String = set.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
        assert!(set.chunks.iter().enumerate().all(|(i, c)| c.index == i && c.source == "m.wav"));
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("m.wav", "", 10).unwrap().chunks.is_empty());
    }

    #[test]
    fn exact_multiple_and_multibyte() {
        let set = chunk_text("m", "éééé", 2).unwrap();
        assert_eq!(set.chunks.len(), 2);
        assert_eq!(set.chunks[1].text, "éé");
    }

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(chunk_text("m", "abc", 0), Err(ChunkError::ZeroSize));
    }
}

//! Heading-aware deterministic chunker
//!
//! Splits documentation source into [`ContentChunk`]s along a separator
//! hierarchy: paragraph breaks first, then line breaks, then sentence
//! and space boundaries. A coarser boundary that fits the window is
//! never abandoned for a finer one.
//!
//! The pass is a pure function of its input. Identical source text
//! always reproduces identical boundaries, ids, and hashes, which is
//! what makes re-ingestion idempotent.

use docpilot_common::config::IngestionConfig;
use docpilot_common::types::{estimate_tokens, ContentChunk};
use tracing::debug;

/// Window sizes for the chunking pass, in estimated tokens
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Soft target; a chunk closes once the next block would overflow it
    pub target_tokens: u32,
    /// Hard ceiling; a block above it is split at the next finer boundary
    pub max_tokens: u32,
    /// Fraction of the target carried into the next chunk as overlap
    pub overlap_fraction: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self::from(&IngestionConfig::default())
    }
}

impl From<&IngestionConfig> for ChunkerConfig {
    fn from(config: &IngestionConfig) -> Self {
        Self {
            target_tokens: config.target_tokens,
            // A ceiling below the target would split everything.
            max_tokens: config.max_tokens_per_chunk.max(config.target_tokens),
            overlap_fraction: config.overlap_fraction.clamp(0.0, 0.5),
        }
    }
}

/// One parsed unit of source text: a paragraph, a heading line, or a
/// whole fenced code block. Atomic blocks are never split and never
/// carried as overlap.
#[derive(Debug, Clone)]
struct Block {
    text: String,
    heading_path: Vec<String>,
    tokens: u32,
    atomic: bool,
}

/// Deterministic source-to-chunks pass
pub struct ChunkStore {
    config: ChunkerConfig,
}

impl ChunkStore {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split one source file into ordered chunks. Empty or whitespace-only
    /// input yields no chunks.
    pub fn chunk(&self, source_text: &str, source_path: &str) -> Vec<ContentChunk> {
        let mut units = Vec::new();
        for block in parse_blocks(source_text) {
            if !block.atomic && block.tokens > self.config.max_tokens {
                units.extend(self.split_block(block));
            } else {
                units.push(block);
            }
        }

        let overlap_budget =
            (self.config.target_tokens as f32 * self.config.overlap_fraction) as u32;
        let mut chunks: Vec<ContentChunk> = Vec::new();
        let mut current: Vec<Block> = Vec::new();
        let mut current_tokens: u32 = 0;

        for unit in units {
            if unit.tokens > self.config.target_tokens {
                // Oversized unit (code fence or unsplittable run): close
                // whatever came before and emit it alone, uncarried.
                if !current.is_empty() {
                    emit(&mut chunks, &current, source_path);
                    current.clear();
                    current_tokens = 0;
                }
                emit(&mut chunks, std::slice::from_ref(&unit), source_path);
                continue;
            }

            if !current.is_empty() && current_tokens + unit.tokens > self.config.target_tokens {
                emit(&mut chunks, &current, source_path);
                current = carry_tail(&current, overlap_budget);
                current_tokens = current.iter().map(|b| b.tokens).sum();
            }
            current_tokens += unit.tokens;
            current.push(unit);
        }
        if !current.is_empty() {
            emit(&mut chunks, &current, source_path);
        }

        debug!(
            source_path,
            input_len = source_text.len(),
            chunk_count = chunks.len(),
            "source chunked"
        );
        chunks
    }

    /// Break an over-ceiling paragraph at line boundaries, aiming each
    /// piece at the target window. Single lines that still exceed the
    /// ceiling drop down to sentence/space boundaries.
    fn split_block(&self, block: Block) -> Vec<Block> {
        let target_chars = self.config.target_tokens as usize * 4;
        let max_chars = self.config.max_tokens as usize * 4;

        let mut pieces: Vec<String> = Vec::new();
        let mut buffer = String::new();
        for line in block.text.lines() {
            if line.len() > max_chars {
                if !buffer.is_empty() {
                    pieces.push(std::mem::take(&mut buffer));
                }
                pieces.extend(split_long_line(line, target_chars));
                continue;
            }
            if !buffer.is_empty() && buffer.len() + 1 + line.len() > target_chars {
                pieces.push(std::mem::take(&mut buffer));
            }
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(line);
        }
        if !buffer.is_empty() {
            pieces.push(buffer);
        }

        pieces
            .into_iter()
            .filter(|text| !text.trim().is_empty())
            .map(|text| Block {
                tokens: estimate_tokens(&text),
                heading_path: block.heading_path.clone(),
                text,
                atomic: false,
            })
            .collect()
    }
}

/// Parse source lines into blocks, tracking the heading stack as we go.
/// Fence contents are opaque: no heading detection, no paragraph breaks.
fn parse_blocks(source: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut fence: Option<(char, usize)> = None;
    let mut fence_lines: Vec<&str> = Vec::new();

    for line in source.lines() {
        if let Some((open_char, open_run)) = fence {
            fence_lines.push(line);
            if is_closing_fence(line, open_char, open_run) {
                push_block(&mut blocks, fence_lines.join("\n"), &heading_stack, true);
                fence_lines.clear();
                fence = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            flush_paragraph(&mut blocks, &mut paragraph, &heading_stack);
            fence = Some(marker);
            fence_lines.push(line);
            continue;
        }

        if let Some((level, title)) = heading_line(line) {
            flush_paragraph(&mut blocks, &mut paragraph, &heading_stack);
            while heading_stack.last().is_some_and(|(l, _)| *l >= level) {
                heading_stack.pop();
            }
            heading_stack.push((level, title.to_string()));
            // The heading line heads its own section, so its path
            // includes itself.
            push_block(&mut blocks, line.trim().to_string(), &heading_stack, false);
            continue;
        }

        if line.trim().is_empty() {
            flush_paragraph(&mut blocks, &mut paragraph, &heading_stack);
        } else {
            paragraph.push(line);
        }
    }

    // An unclosed fence at EOF is kept whole rather than reparsed.
    if !fence_lines.is_empty() {
        push_block(&mut blocks, fence_lines.join("\n"), &heading_stack, true);
    }
    flush_paragraph(&mut blocks, &mut paragraph, &heading_stack);
    blocks
}

fn push_block(blocks: &mut Vec<Block>, text: String, stack: &[(usize, String)], atomic: bool) {
    if text.trim().is_empty() {
        return;
    }
    blocks.push(Block {
        tokens: estimate_tokens(&text),
        heading_path: stack.iter().map(|(_, title)| title.clone()).collect(),
        text,
        atomic,
    });
}

fn flush_paragraph(blocks: &mut Vec<Block>, paragraph: &mut Vec<&str>, stack: &[(usize, String)]) {
    if paragraph.is_empty() {
        return;
    }
    let text = paragraph.join("\n");
    paragraph.clear();
    push_block(blocks, text, stack, false);
}

/// Close the current accumulation as one chunk. Blocks are re-joined with
/// a paragraph break; the chunk carries the heading path of its first
/// block.
fn emit(chunks: &mut Vec<ContentChunk>, blocks: &[Block], source_path: &str) {
    let Some(first) = blocks.first() else {
        return;
    };
    let text = blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let index = chunks.len() as u32;
    chunks.push(ContentChunk::new(
        text,
        source_path.to_string(),
        first.heading_path.clone(),
        index,
    ));
}

/// Trailing blocks of a just-closed chunk that seed the next one, newest
/// to oldest up to the overlap budget. Always a strict subset, and never
/// an atomic block.
fn carry_tail(blocks: &[Block], budget: u32) -> Vec<Block> {
    let mut carried: Vec<Block> = Vec::new();
    let mut total = 0u32;
    for block in blocks.iter().rev() {
        if block.atomic
            || carried.len() + 1 >= blocks.len()
            || total + block.tokens > budget
        {
            break;
        }
        total += block.tokens;
        carried.push(block.clone());
    }
    carried.reverse();
    carried
}

/// `(fence_char, run_length)` when the line opens a fenced code block
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start();
    let first = trimmed.chars().next()?;
    if first != '`' && first != '~' {
        return None;
    }
    let run = trimmed.chars().take_while(|&c| c == first).count();
    (run >= 3).then_some((first, run))
}

fn is_closing_fence(line: &str, open_char: char, open_run: usize) -> bool {
    let trimmed = line.trim();
    let run = trimmed.chars().take_while(|&c| c == open_char).count();
    run >= open_run && trimmed.chars().all(|c| c == open_char)
}

/// ATX heading outside a fence: 1-6 `#` followed by a space and a title
fn heading_line(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim();
    (!title.is_empty()).then_some((level, title))
}

/// Sentence-boundary split for a single line longer than the ceiling.
/// Falls back to the last space; a run with no space at all is emitted
/// whole rather than cut mid-token.
fn split_long_line(line: &str, target_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = line.trim_end();
    loop {
        let boundary = prefix_boundary(rest, target_chars);
        if boundary >= rest.len() {
            if !rest.is_empty() {
                pieces.push(rest.to_string());
            }
            break;
        }
        let window = &rest[..boundary];
        let cut = [". ", "! ", "? "]
            .iter()
            .filter_map(|sep| window.rfind(sep).map(|p| p + sep.len()))
            .max()
            .or_else(|| window.rfind(' ').map(|p| p + 1));
        match cut {
            Some(cut) => {
                pieces.push(rest[..cut].trim_end().to_string());
                rest = rest[cut..].trim_start();
            }
            None => {
                pieces.push(rest.to_string());
                break;
            }
        }
    }
    pieces
}

/// Byte index of the `max_chars`-th character, or the full length
fn prefix_boundary(text: &str, max_chars: usize) -> usize {
    text.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(target: u32, max: u32, overlap: f32) -> ChunkStore {
        ChunkStore::new(ChunkerConfig {
            target_tokens: target,
            max_tokens: max,
            overlap_fraction: overlap,
        })
    }

    #[test]
    fn test_small_document_is_one_chunk() {
        let chunks = store(100, 200, 0.2).chunk("Just one short paragraph.", "intro.md");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Just one short paragraph.");
        assert_eq!(chunks[0].chunk_index, 0);
        assert!(chunks[0].heading_path.is_empty());
    }

    #[test]
    fn test_identical_input_identical_chunks() {
        let source = "# Title\n\nFirst paragraph here.\n\nSecond paragraph here.\n\n\
                      ```\ncode\n```\n\nThird paragraph here.\n";
        let chunker = store(10, 50, 0.2);
        let first = chunker.chunk(source, "docs/guide.md");
        let second = chunker.chunk(source, "docs/guide.md");
        assert_eq!(first, second);
        assert!(!first.is_empty());
        for (i, chunk) in first.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(
                chunk.id,
                ContentChunk::deterministic_id("docs/guide.md", i as u32)
            );
        }
    }

    #[test]
    fn test_heading_stack_tracks_ancestors() {
        let source = "# Alpha\n\nFirst paragraph body text goes here.\n\n\
                      ## Beta\n\nSecond paragraph body text goes here.\n\n\
                      # Gamma\n\nThird paragraph body text goes here.\n";
        let chunks = store(10, 100, 0.0).chunk(source, "docs/tree.md");

        let path_of = |needle: &str| {
            chunks
                .iter()
                .find(|c| c.text.contains(needle))
                .map(|c| c.heading_path.clone())
                .unwrap()
        };
        assert_eq!(path_of("First paragraph"), vec!["Alpha"]);
        assert_eq!(path_of("Second paragraph"), vec!["Alpha", "Beta"]);
        // A sibling h1 pops the whole stack.
        assert_eq!(path_of("Third paragraph"), vec!["Gamma"]);
    }

    #[test]
    fn test_fence_hides_heading_markers() {
        let source = "# Real\n\nBefore the fence.\n\n```\n# not a heading\n```\n\nAfter the fence.\n";
        let chunks = store(100, 200, 0.2).chunk(source, "docs/fence.md");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, vec!["Real"]);
        assert!(chunks[0].text.contains("# not a heading"));
    }

    #[test]
    fn test_oversized_code_block_emitted_whole() {
        let code = format!("```\n{}\n```", "let value = compute(input);\n".repeat(20));
        let source = format!("Intro paragraph.\n\n{code}\n\nOutro paragraph.\n");
        let chunks = store(10, 20, 0.2).chunk(&source, "docs/code.md");

        let fenced: Vec<_> = chunks.iter().filter(|c| c.text.contains("```")).collect();
        assert_eq!(fenced.len(), 1);
        assert_eq!(fenced[0].text, code.trim_end());
        assert!(fenced[0].token_count > 20);
    }

    #[test]
    fn test_overlap_carries_trailing_block() {
        let para_a = "Alpha alpha alpha alpha alpha alpha.";
        let para_b = "Bravo bravo bravo bravo bravo bravo.";
        let para_c = "Charlie charlie charlie charlie char.";
        let para_d = "Delta delta delta delta delta delta.";
        let source = format!("{para_a}\n\n{para_b}\n\n{para_c}\n\n{para_d}\n");
        let chunks = store(20, 100, 0.5).chunk(&source, "docs/overlap.md");

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.ends_with(para_b));
        assert!(chunks[1].text.starts_with(para_b));
        assert!(chunks[1].text.ends_with(para_c));
        assert!(chunks[2].text.starts_with(para_c));
    }

    #[test]
    fn test_paragraph_within_ceiling_stays_whole() {
        // Over target but under the ceiling: line boundaries are not used.
        let para = "One sentence here. Another sentence there. A third one.";
        let chunks = store(10, 20, 0.2).chunk(para, "docs/whole.md");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, para);
    }

    #[test]
    fn test_long_line_splits_at_sentence_boundaries() {
        let line = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let chunks = store(10, 15, 0.0).chunk(line, "docs/long.md");

        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].text, "One two three. Four five six.");
        let rejoined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, line);
    }

    #[test]
    fn test_empty_and_blank_input() {
        let chunker = store(100, 200, 0.2);
        assert!(chunker.chunk("", "docs/empty.md").is_empty());
        assert!(chunker.chunk("\n\n  \n", "docs/blank.md").is_empty());
    }

    #[test]
    fn test_unclosed_fence_kept_whole() {
        let source = "Intro.\n\n```\nlet unfinished = true;\n";
        let chunks = store(100, 200, 0.2).chunk(source, "docs/unclosed.md");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("let unfinished = true;"));
    }
}

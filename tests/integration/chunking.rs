//! Word-respecting chunking, including fragments split mid-word.

use casework::chunker::{chunk, Chunker};
use proptest::prelude::*;

#[test]
fn test_short_sentence_is_one_chunk() {
    let chunks = chunk("Patient is stable.", 100, 0);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content, "Patient is stable.");
    assert_eq!(chunks[0].position, 0);
    assert_eq!(chunks[0].length, 18);
    assert!(chunks[0].is_word_boundary);
}

#[test]
fn test_running_offset_continues_positions() {
    let chunks = chunk("Blood cultures pending", 8, 40);
    assert_eq!(chunks[0].position, 40);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].end(), pair[1].position);
    }
}

#[test]
fn test_words_split_across_fragments_stay_whole() {
    let mut chunker = Chunker::new(10);
    let mut chunks = chunker.push("Hypoten");
    assert!(chunks.is_empty(), "partial word is held back");
    chunks.extend(chunker.push("sion resolved with flu"));
    chunks.extend(chunker.push("ids"));
    chunks.extend(chunker.finish());

    let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents.concat(), "Hypotension resolved with fluids");
    assert!(!contents
        .iter()
        .any(|c| c.starts_with("sion") || c.starts_with("ids")));
    assert_eq!(chunker.offset(), "Hypotension resolved with fluids".chars().count());
}

#[test]
fn test_metadata_is_attached_when_requested() {
    let mut chunker = Chunker::new(50).with_metadata("scripted", "scripted-model");
    let chunks = chunker.push("Afebrile overnight ");
    let metadata = chunks[0].metadata.as_ref().unwrap();
    assert_eq!(metadata.provider, "scripted");
    assert_eq!(metadata.model, "scripted-model");
}

proptest! {
    #[test]
    fn prop_chunking_is_lossless_and_contiguous(
        words in proptest::collection::vec("[a-zA-Z]{1,12}", 0..40),
        max_size in 1usize..40,
    ) {
        let text = words.join(" ");
        let chunks = chunk(&text, max_size, 0);

        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        prop_assert_eq!(&joined, &text);

        let mut position = 0;
        for c in &chunks {
            prop_assert_eq!(c.position, position);
            prop_assert_eq!(c.length, c.content.chars().count());
            // Only a single word longer than the limit may overflow it.
            if c.length > max_size {
                prop_assert_eq!(c.content.split_whitespace().count(), 1);
            }
            position += c.length;
        }
    }

    #[test]
    fn prop_fragmenting_does_not_change_the_text(
        text in "[a-z ]{0,80}",
        cuts in proptest::collection::vec(0usize..80, 0..6),
    ) {
        let mut bounds: Vec<usize> = cuts.into_iter().filter(|&c| c <= text.len()).collect();
        bounds.push(0);
        bounds.push(text.len());
        bounds.sort_unstable();
        bounds.dedup();

        let mut chunker = Chunker::new(12);
        let mut out = String::new();
        for pair in bounds.windows(2) {
            for c in chunker.push(&text[pair[0]..pair[1]]) {
                out.push_str(&c.content);
            }
        }
        for c in chunker.finish() {
            out.push_str(&c.content);
        }
        prop_assert_eq!(out, text);
    }
}

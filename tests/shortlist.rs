//! Shortlist generation against a realistically sized lexical table.

use skiff::shortlist::{write_shortlist, ShortlistGenerator};

#[test]
fn test_known_rows_with_large_vocabulary() {
    const TARGET_VOCAB: usize = 24_000;
    const FREQUENT: u64 = 100;

    // Rows for three source words; everything else is empty.
    let rows: &[(usize, &[u32])] = &[
        (17, &[200, 300]),
        (9_000, &[400]),
        (23_000, &[500, 600, 700]),
    ];

    let word_count = 23_001usize;
    let mut word_to_offset = Vec::with_capacity(word_count + 1);
    let mut shortlist: Vec<u32> = Vec::new();
    for word in 0..word_count {
        word_to_offset.push(shortlist.len() as u64);
        if let Some((_, ids)) = rows.iter().find(|(w, _)| *w == word) {
            shortlist.extend_from_slice(ids);
        }
    }
    word_to_offset.push(shortlist.len() as u64);

    let blob = write_shortlist(FREQUENT, 100, &word_to_offset, &shortlist);
    let generator =
        ShortlistGenerator::load(&blob, TARGET_VOCAB, false, true).expect("valid blob");

    let generated = generator.generate(&[17, 9_000, 23_000]);
    let words = generated.words();

    // Sorted ascending with no duplicates.
    assert!(words.windows(2).all(|pair| pair[0] < pair[1]));
    // The frequent head [0, 100) is always admitted.
    for id in 0..FREQUENT as u32 {
        assert!(words.contains(&id));
    }
    // The union of the three lexical rows is admitted.
    for id in [200u32, 300, 400, 500, 600, 700] {
        assert!(words.contains(&id));
    }
    // Tiling requirement.
    assert_eq!(words.len() % 8, 0);
}

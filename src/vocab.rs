use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Index shared by the START and END markers.
pub const BOUNDARY: usize = 0;

/// Letter <-> index maps. Letters are Unicode scalar values numbered `1..=n`
/// in sorted order; index 0 is the START/END marker and has no letter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    letter_to_index: BTreeMap<char, usize>,
    index_to_letter: BTreeMap<usize, char>,
}

/// A string mapped to letter indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encoded {
    pub indices: Vec<usize>,
    /// Characters dropped because the vocabulary does not know them.
    pub skipped: usize,
}

impl Vocabulary {
    /// Every letter seen at least `count_threshold` times across `sentences`.
    pub fn from_sentences<S: AsRef<str>>(sentences: &[S], count_threshold: usize) -> Result<Self> {
        let mut counts: BTreeMap<char, usize> = BTreeMap::new();
        for s in sentences {
            for ch in s.as_ref().chars() {
                *counts.entry(ch).or_default() += 1;
            }
        }
        let letters = counts.into_iter().filter(|&(_, n)| n >= count_threshold.max(1)).map(|(ch, _)| ch);
        let vocab = Self::from_letters(letters);
        if vocab.letters() == 0 {
            return Err(Error::EmptyCorpus);
        }
        Ok(vocab)
    }

    /// Numbers `letters` from 1 in sorted order, ignoring repeats.
    pub fn from_letters(letters: impl IntoIterator<Item = char>) -> Self {
        let mut sorted: Vec<char> = letters.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut vocab = Vocabulary::default();
        for (i, ch) in sorted.into_iter().enumerate() {
            vocab.letter_to_index.insert(ch, i + 1);
            vocab.index_to_letter.insert(i + 1, ch);
        }
        vocab
    }

    /// Number of known letters.
    pub fn letters(&self) -> usize {
        self.letter_to_index.len()
    }

    /// Number of model outputs: every letter plus the START/END marker.
    pub fn size(&self) -> usize {
        self.letters() + 1
    }

    pub fn index_of(&self, ch: char) -> Option<usize> {
        self.letter_to_index.get(&ch).copied()
    }

    pub fn letter(&self, index: usize) -> Option<char> {
        self.index_to_letter.get(&index).copied()
    }

    /// Maps `s` to indices. Unknown characters are skipped and counted,
    /// never mapped onto [`BOUNDARY`].
    pub fn encode(&self, s: &str) -> Encoded {
        let mut indices = Vec::with_capacity(s.len());
        let mut skipped = 0;
        for ch in s.chars() {
            match self.index_of(ch) {
                Some(ix) => indices.push(ix),
                None => skipped += 1,
            }
        }
        Encoded { indices, skipped }
    }

    /// Inverse of [`Vocabulary::encode`]; indices without a letter vanish.
    pub fn decode(&self, indices: &[usize]) -> String {
        indices.iter().filter_map(|&ix| self.letter(ix)).collect()
    }

    /// Checks that both maps describe the same letters numbered `1..=n`.
    pub fn validate(&self) -> Result<()> {
        if self.letter_to_index.len() != self.index_to_letter.len() {
            return Err(Error::InvalidVocabulary(format!(
                "{} letters but {} indices",
                self.letter_to_index.len(),
                self.index_to_letter.len()
            )));
        }
        for (expected, (&ix, &ch)) in (1..).zip(self.index_to_letter.iter()) {
            if ix != expected {
                return Err(Error::InvalidVocabulary(format!("index {ix} out of sequence, expected {expected}")));
            }
            if self.index_of(ch) != Some(ix) {
                return Err(Error::InvalidVocabulary(format!("letter {ch:?} does not map back to {ix}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_are_sorted_from_one() {
        let v = Vocabulary::from_sentences(&["cab", "bad"], 1).unwrap();
        assert_eq!(v.letters(), 4);
        assert_eq!(v.size(), 5);
        assert_eq!(v.index_of('a'), Some(1));
        assert_eq!(v.index_of('d'), Some(4));
        assert_eq!(v.letter(BOUNDARY), None);
        v.validate().unwrap();
    }

    #[test]
    fn threshold_drops_rare_letters() {
        let v = Vocabulary::from_sentences(&["aab", "ac"], 2).unwrap();
        assert_eq!(v.letters(), 1);
        assert_eq!(v.index_of('b'), None);
    }

    #[test]
    fn unicode_letters_are_single_entries() {
        let v = Vocabulary::from_sentences(&["žluť"], 1).unwrap();
        assert_eq!(v.letters(), 4);
        assert_eq!(v.decode(&v.encode("ťž").indices), "ťž");
    }

    #[test]
    fn unknown_characters_are_skipped_not_aliased_to_boundary() {
        let v = Vocabulary::from_sentences(&["ab"], 1).unwrap();
        let e = v.encode("aXbY");
        assert_eq!(e.indices, vec![1, 2]);
        assert_eq!(e.skipped, 2);
        assert!(!e.indices.contains(&BOUNDARY));
    }

    #[test]
    fn empty_corpus_is_rejected() {
        assert!(matches!(Vocabulary::from_sentences::<&str>(&[], 1), Err(Error::EmptyCorpus)));
        assert!(matches!(Vocabulary::from_sentences(&["a"], 2), Err(Error::EmptyCorpus)));
    }

    #[test]
    fn survives_json_and_detects_tampering() {
        let v = Vocabulary::from_sentences(&["hello"], 1).unwrap();
        let json = serde_json::to_string(&v).unwrap();
        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);

        let mut bad = v.clone();
        bad.index_to_letter.insert(9, 'z');
        bad.letter_to_index.insert('z', 9);
        assert!(matches!(bad.validate(), Err(Error::InvalidVocabulary(_))));
    }
}

use anyhow::{Result, ensure};

use crate::error::RuntimeError;

/// Token sequences encoded as flat ids plus exclusive end offsets, so word `i`
/// is `ids[offsets[i - 1]..offsets[i]]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordsList {
    ids: Vec<u32>,
    offsets: Vec<usize>,
}

impl WordsList {
    pub fn new(ids: Vec<u32>, offsets: Vec<usize>) -> Result<Self> {
        let mut prev = 0;
        for &end in &offsets {
            ensure!(
                end > prev && end <= ids.len(),
                RuntimeError::configuration(format!(
                    "words list offsets {offsets:?} are not increasing within {} ids",
                    ids.len()
                ))
            );
            prev = end;
        }
        ensure!(
            prev == ids.len(),
            RuntimeError::configuration("words list has ids past its last offset")
        );
        Ok(Self { ids, offsets })
    }

    pub fn from_words<W: AsRef<[u32]>>(words: &[W]) -> Result<Self> {
        let mut ids = Vec::new();
        let mut offsets = Vec::with_capacity(words.len());
        for word in words {
            ids.extend_from_slice(word.as_ref());
            offsets.push(ids.len());
        }
        Self::new(ids, offsets)
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn words(&self) -> impl Iterator<Item = &[u32]> {
        let starts = std::iter::once(0).chain(self.offsets.iter().copied());
        starts
            .zip(self.offsets.iter().copied())
            .map(|(start, end)| &self.ids[start..end])
    }

    /// Sets to negative infinity every token that would complete a listed word
    /// after `history`.
    pub fn ban(&self, logits: &mut [f32], history: &[u32]) {
        for word in self.words() {
            let Some((&last, prefix)) = word.split_last() else {
                continue;
            };
            if history.ends_with(prefix)
                && let Some(logit) = logits.get_mut(last as usize)
            {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    /// Whether `history` ends with any listed word.
    pub fn completed_by(&self, history: &[u32]) -> bool {
        self.words().any(|word| history.ends_with(word))
    }
}

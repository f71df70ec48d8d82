use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::element::Element;
use crate::bail;
use crate::error::Result;
use crate::model::{LstmLayout, Model};
use crate::optim::RmsProp;
use crate::vocab::Vocabulary;

pub const FORMAT_VERSION: u32 = 1;

// ============================================================================
// CHECKPOINT - everything needed to resume training or sample
// ============================================================================

/// Persisted session state. Tapes, tick-local tensors, gradients and the
/// training corpus are never part of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "E: Element")]
pub struct Checkpoint<E: Element> {
    pub version: u32,
    /// Seconds since the Unix epoch at save time.
    pub saved_at: u64,
    pub precision: String,
    pub hidden_sizes: Vec<usize>,
    pub letter_size: usize,
    pub tick: usize,
    pub model: Model<E>,
    pub vocab: Vocabulary,
    pub solver: RmsProp<E>,
}

/// On-disk encoding, picked from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Json,
    Bincode,
}

impl Format {
    /// `.json` is JSON, anything else bincode.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Bincode,
        }
    }
}

impl<E: Element> Checkpoint<E> {
    pub fn new(
        model: Model<E>,
        hidden_sizes: Vec<usize>,
        letter_size: usize,
        vocab: Vocabulary,
        solver: RmsProp<E>,
        tick: usize,
    ) -> Self {
        let saved_at = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        Checkpoint {
            version: FORMAT_VERSION,
            saved_at,
            precision: E::NAME.to_string(),
            hidden_sizes,
            letter_size,
            tick,
            model,
            vocab,
            solver,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = match Format::from_path(path) {
            Format::Json => serde_json::to_vec(self)?,
            Format::Bincode => bincode::serialize(self)?,
        };
        fs::write(path, &bytes)?;
        info!(
            path = %path.display(),
            tick = self.tick,
            params = self.model.scalar_count(),
            size_mb = bytes.len() as f64 / 1_048_576.0,
            "saved checkpoint"
        );
        Ok(())
    }

    /// Reads and validates a checkpoint.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let cp: Checkpoint<E> = match Format::from_path(path) {
            Format::Json => serde_json::from_slice(&bytes)?,
            Format::Bincode => bincode::deserialize(&bytes)?,
        };
        cp.layout()?;
        info!(
            path = %path.display(),
            tick = cp.tick,
            hidden = ?cp.hidden_sizes,
            letters = cp.vocab.letters(),
            "loaded checkpoint"
        );
        Ok(cp)
    }

    /// Checks the stored model against the stored architecture and
    /// vocabulary, and resolves it.
    pub fn layout(&self) -> Result<LstmLayout> {
        if self.version != FORMAT_VERSION {
            bail!("unsupported checkpoint version {}", self.version);
        }
        if self.precision != E::NAME {
            bail!("checkpoint holds {} parameters, expected {}", self.precision, E::NAME);
        }
        self.vocab.validate()?;
        let layout = LstmLayout::resolve(&self.model, &self.hidden_sizes)?;
        layout.embedding()?;
        self.model.expect_shape(crate::model::EMBEDDING, self.vocab.size(), self.letter_size)?;
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tensor::Tensor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::path::PathBuf;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("char-lstm-{}-{}", std::process::id(), name))
    }

    fn sample() -> Checkpoint<f64> {
        let vocab = Vocabulary::from_sentences(&["abc"], 1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let model = Model::new_char_lstm(vocab.size(), 3, &[4], &mut rng).unwrap();
        Checkpoint::new(model, vec![4], 3, vocab, RmsProp::default(), 12)
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(Format::from_path(Path::new("a/model.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("model.JSON")), Format::Json);
        assert_eq!(Format::from_path(Path::new("model.bin")), Format::Bincode);
        assert_eq!(Format::from_path(Path::new("model")), Format::Bincode);
    }

    #[test]
    fn bincode_round_trip_is_exact() {
        let cp = sample();
        let path = tmp("exact.bin");
        cp.save(&path).unwrap();
        let back = Checkpoint::<f64>::load(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(back, cp);
    }

    #[test]
    fn wrong_precision_is_rejected() {
        let cp = sample();
        let path = tmp("precision.json");
        cp.save(&path).unwrap();
        let err = Checkpoint::<f32>::load(&path).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(matches!(err, Error::Msg(_)));
    }

    #[test]
    fn embedding_must_match_vocabulary() {
        let mut cp = sample();
        cp.model.insert(crate::model::EMBEDDING, Tensor::zeros(9, 3));
        assert!(cp.layout().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Checkpoint::<f64>::load(tmp("does-not-exist.bin")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}

//! Character-level LSTM trained by backpropagation through time.
//!
//! The engine records every forward operator into a per-tick [`Graph`]: an
//! arena of tensors plus a tape of tagged backward records that refer to
//! arena slots. [`Graph::backward`] replays the tape in reverse. Everything
//! is generic over the [`Element`] storage type (`f32` or `f64`).
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use char_lstm::{trainer::{sentences_from_text, Session}, Config};
//!
//! let config = Config { hidden_sizes: vec![20], ticks: 1000, ..Config::default() };
//! let mut session = Session::<f32>::new(config, sentences_from_text("hello\nworld"))?;
//! session.run(&AtomicBool::new(false), |r| println!("{:?}", r.samples))?;
//! # Ok::<(), char_lstm::Error>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod element;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod lstm;
pub mod model;
pub mod optim;
pub mod sample;
pub mod tensor;
pub mod trainer;
pub mod vocab;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use cost::{cost_of_sentence, Cost};
pub use element::Element;
pub use error::{Error, Result};
pub use graph::{Graph, Recorder, Tid};
pub use lstm::{forward, CellMemory, CellState};
pub use model::{LstmLayout, Model};
pub use optim::{RmsProp, SolverStats};
pub use sample::{predict, sample_sentence, SampleConfig};
pub use tensor::Tensor;
pub use trainer::Session;
pub use vocab::Vocabulary;

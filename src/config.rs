// ============================================================================
// CONFIGURATION
// ============================================================================

use std::env;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::optim::{DEFAULT_DECAY, DEFAULT_EPS};
use crate::sample::SampleConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Sample,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "sample" => Ok(Mode::Sample),
            other => Err(format!("unknown mode `{other}`")),
        }
    }
}

/// Storage type of the parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    F32,
    F64,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" => Ok(Precision::F32),
            "f64" | "float64" => Ok(Precision::F64),
            other => Err(format!("unknown precision `{other}`")),
        }
    }
}

/// Hidden layer sizes written as a comma list, e.g. `30,30,30`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiddenSizes(pub Vec<usize>);

impl FromStr for HiddenSizes {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let sizes = s
            .split(',')
            .map(|p| p.trim().parse::<usize>().map_err(|e| format!("`{p}`: {e}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(format!("`{s}` needs one or more non-zero sizes"));
        }
        Ok(HiddenSizes(sizes))
    }
}

impl fmt::Display for HiddenSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|h| h.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub mode: Mode,
    pub hidden_sizes: Vec<usize>,
    pub letter_size: usize,
    pub learning_rate: f64,
    pub regc: f64,
    pub clipval: f64,
    pub decay: f64,
    pub smooth_eps: f64,
    pub training_text: String,
    pub training_file: String,
    pub count_threshold: usize,
    /// Tick budget; 0 runs until cancelled.
    pub ticks: usize,
    pub report_every: usize,
    /// Checkpoint cadence in ticks; 0 disables periodic saves.
    pub save_every: usize,
    pub save_path: String,
    pub load_path: String,
    pub temperature: f64,
    pub max_chars: usize,
    pub samples: usize,
    pub argmax: bool,
    pub prime: String,
    pub seed: Option<u64>,
    pub precision: Precision,
}

pub const DEFAULT_TRAINING_TEXT: &str = "the quick brown fox jumps over the lazy dog\n\
she sells sea shells by the sea shore\n\
a stitch in time saves nine\n\
all that glitters is not gold\n\
the early bird catches the worm";

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Train,
            hidden_sizes: vec![30, 30, 30],
            letter_size: 10,
            learning_rate: 0.01,
            regc: 0.000001,
            clipval: 5.0,
            decay: DEFAULT_DECAY,
            smooth_eps: DEFAULT_EPS,
            training_text: DEFAULT_TRAINING_TEXT.to_string(),
            training_file: String::new(),
            count_threshold: 1,
            ticks: 0,
            report_every: 250,
            save_every: 1000,
            save_path: "./model.json".to_string(),
            load_path: String::new(),
            temperature: 1.0,
            max_chars: 500,
            samples: 2,
            argmax: false,
            prime: String::new(),
            seed: None,
            precision: Precision::F64,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse_args(env::args().skip(1))
    }

    /// Parses `--key=value` pairs over the defaults. Keys are
    /// case-insensitive; unknown keys and unparsable values are logged and
    /// leave the default in place.
    pub fn parse_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for arg in args {
            let arg = arg.as_ref().trim_start_matches("--");
            let Some((key, value)) = arg.split_once('=') else {
                warn!(arg, "ignoring argument without `=`");
                continue;
            };
            let key = key.to_lowercase();
            match key.as_str() {
                "mode" => set(&key, value, &mut config.mode),
                "hidden" | "hiddensizes" => {
                    let mut h = HiddenSizes(config.hidden_sizes.clone());
                    set(&key, value, &mut h);
                    config.hidden_sizes = h.0;
                }
                "lettersize" => set(&key, value, &mut config.letter_size),
                "learningrate" => set(&key, value, &mut config.learning_rate),
                "regc" => set(&key, value, &mut config.regc),
                "clipval" => set(&key, value, &mut config.clipval),
                "decay" => set(&key, value, &mut config.decay),
                "smootheps" => set(&key, value, &mut config.smooth_eps),
                "trainingtext" => config.training_text = value.replace("\\n", "\n"),
                "trainingfile" => config.training_file = value.to_string(),
                "countthreshold" => set(&key, value, &mut config.count_threshold),
                "ticks" => set(&key, value, &mut config.ticks),
                "reportevery" => set(&key, value, &mut config.report_every),
                "saveevery" => set(&key, value, &mut config.save_every),
                "savepath" => config.save_path = value.to_string(),
                "loadpath" => config.load_path = value.to_string(),
                "temperature" => set(&key, value, &mut config.temperature),
                "maxchars" => set(&key, value, &mut config.max_chars),
                "samples" => set(&key, value, &mut config.samples),
                "argmax" => set(&key, value, &mut config.argmax),
                "prime" => config.prime = value.to_string(),
                "seed" => match value.trim().parse::<u64>() {
                    Ok(seed) => config.seed = Some(seed),
                    Err(e) => warn!(key = %key, value, error = %e, "keeping default for unparsable option"),
                },
                "precision" => set(&key, value, &mut config.precision),
                _ => warn!(key = %key, "ignoring unknown option"),
            }
        }
        config
    }

    /// Generation settings for reports and sample mode.
    pub fn sampling(&self) -> SampleConfig {
        SampleConfig { max_length: self.max_chars, temperature: self.temperature, sample: !self.argmax }
    }
}

/// Parses `value` into `slot`; on failure logs and keeps the old value.
fn set<T>(key: &str, value: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value.trim().parse() {
        Ok(v) => *slot = v,
        Err(e) => warn!(key, value, error = %e, "keeping default for unparsable option"),
    }
}

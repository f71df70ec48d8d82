use std::sync::atomic::AtomicBool;

use char_lstm::cost::cost_of_sentence;
use char_lstm::trainer::{median, sentences_from_text, Session};
use char_lstm::vocab::BOUNDARY;
use char_lstm::{Config, SampleConfig};

fn config(hidden: Vec<usize>, seed: u64) -> Config {
    Config {
        hidden_sizes: hidden,
        letter_size: 5,
        learning_rate: 0.002,
        seed: Some(seed),
        report_every: 0,
        save_every: 0,
        save_path: String::new(),
        ..Config::default()
    }
}

#[test]
fn perplexity_median_falls_on_a_tiny_corpus() {
    let mut s = Session::<f64>::new(config(vec![5], 2024), sentences_from_text("ab\nab\nab")).unwrap();
    let ppl: Vec<f64> = (0..50).map(|_| s.tick().unwrap().cost.perplexity).collect();
    let first = median(&ppl[..10]).unwrap();
    let last = median(&ppl[40..]).unwrap();
    assert!(last < first, "median perplexity went from {first} to {last}");
    assert_eq!(s.ticks(), 50);
}

#[test]
fn training_works_in_single_precision() {
    let mut s = Session::<f32>::new(config(vec![5], 7), sentences_from_text("ab\nab\nab")).unwrap();
    let ppl: Vec<f64> = (0..50).map(|_| s.tick().unwrap().cost.perplexity).collect();
    assert!(ppl.iter().all(|p| p.is_finite()));
    assert!(median(&ppl[40..]).unwrap() < median(&ppl[..10]).unwrap());
}

#[test]
fn greedy_sampling_is_repeatable() {
    let mut s = Session::<f64>::new(config(vec![6, 4], 3), sentences_from_text("hello\nworld")).unwrap();
    for _ in 0..20 {
        s.tick().unwrap();
    }
    let cfg = SampleConfig { max_length: 12, temperature: 1.0, sample: false };
    let a = s.sample(&cfg).unwrap();
    let b = s.sample(&cfg).unwrap();
    assert_eq!(a, b);
}

#[test]
fn zero_length_sample_is_empty() {
    let mut s = Session::<f64>::new(config(vec![4], 1), sentences_from_text("abc")).unwrap();
    let cfg = SampleConfig { max_length: 0, ..SampleConfig::default() };
    assert_eq!(s.sample(&cfg).unwrap(), "");
    assert_eq!(s.predict("ab", &cfg).unwrap(), "");
}

#[test]
fn unknown_characters_are_skipped_not_aliased_to_boundary() {
    let mut s = Session::<f64>::new(config(vec![4], 5), sentences_from_text("ab")).unwrap();
    let vocab = s.vocab().clone();
    assert_eq!(vocab.encode("a#b").indices, vec![1, 2]);
    assert!(!vocab.encode("#").indices.contains(&BOUNDARY));

    // "a#b" trains exactly like "ab": the unknown letter never becomes an
    // early END target.
    let layout = s.layout().clone();
    let mut model = s.model().clone();
    let clean = cost_of_sentence(&mut model.graph(true), &layout, &vocab, "ab").unwrap();
    let noisy = cost_of_sentence(&mut model.graph(true), &layout, &vocab, "a#b").unwrap();
    assert_eq!(clean, noisy);

    let cfg = SampleConfig { max_length: 5, ..SampleConfig::default() };
    assert!(s.predict("##", &cfg).is_ok());
}

#[test]
fn run_stops_on_budget() {
    let cfg = Config { ticks: 4, ..config(vec![3], 9) };
    let mut s = Session::<f32>::new(cfg, sentences_from_text("xy\nyx")).unwrap();
    assert_eq!(s.run(&AtomicBool::new(false), |_| {}).unwrap(), 4);
    assert_eq!(s.ticks(), 4);
    assert!((s.epoch() - 2.0).abs() < 1e-12);
}

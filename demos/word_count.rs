//! Word frequency counter built from a chain of stages
//!
//! Reads lines from stdin, splits them into words, normalizes them, counts frequencies
//! and prints the top words along with the statistics of every stage.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)
//!
//! Set RUST_LOG=debug to watch stages start and complete.

use env_logger::Env;
use parking_lot::Mutex;
use stage_chain::{begin_chain_many, HandoffQueue, StageOptions};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::Arc;

/// Lowercase and strip punctuation; short words become `None` and are dropped
fn clean(word: String) -> Option<String> {
    let cleaned: String = word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    (cleaned.len() > 2).then_some(cleaned)
}

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<(&str, usize)> {
    let mut items: Vec<_> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    items.truncate(n);
    items
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    println!("Word Frequency Counter");
    println!("======================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let lines = Arc::new(HandoffQueue::new());
    let counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

    let sink_counts = Arc::clone(&counts);
    let completion = begin_chain_many(
        Arc::clone(&lines),
        |line: String| Ok(line.split_whitespace().map(str::to_string).collect::<Vec<_>>()),
        StageOptions::threads(2).with_name("split"),
    )?
    .then_with(|word: String| Ok(clean(word)), StageOptions::new().with_name("clean"))?
    .then_sink_with(
        move |word: Option<String>| {
            if let Some(word) = word {
                *sink_counts.lock().entry(word).or_insert(0) += 1;
            }
            Ok(())
        },
        StageOptions::threads(1).with_name("count"),
    )?
    .end_async_with_statistics(|stats| println!("\n{}", stats))?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        lines.try_add_one(line);
    }
    lines.complete_adding();

    completion.wait()?;

    let counts = counts.lock();
    println!("=== Top 10 Words ({} distinct) ===", counts.len());
    for (i, (word, count)) in top_n(&counts, 10).iter().enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }

    Ok(())
}

//! Repeated claim races against a single package.
//!
//! Each round starts a fresh store, releases a barrier of writers that all
//! create a distinct `ClusterExtension` for the same package, and checks that
//! exactly one of them was admitted and that every loser was told who won.
//!
//! Usage:
//!   cargo run --bin race_stress -- [--rounds N] [--writers W] [--mode local|store] [--durable]

use extguard_core::{Arbiter, Arbitration, GuardConfig, GuardError};
use extguard_schema::{ClusterExtension, PackageName};
use extguard_store::{ExtensionStore, MemoryStore};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

const PACKAGE: &str = "pkg-x";

#[derive(Default)]
struct Tally {
    admitted: usize,
    rejected: usize,
    retriable: usize,
    unexpected: usize,
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn open_store(durable: bool, native: bool) -> (Option<tempfile::TempDir>, MemoryStore) {
    let (dir, store) = if durable {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = MemoryStore::open(dir.path()).expect("open durable store");
        (Some(dir), store)
    } else {
        (None, MemoryStore::new())
    };
    (dir, store.with_unique_packages(native))
}

fn run_round(
    round: usize,
    writers: usize,
    config: &GuardConfig,
    durable: bool,
) -> Result<Tally, String> {
    let native = config.arbitration == Arbitration::Store;
    let (_dir, store) = open_store(durable, native);
    let store = Arc::new(store);
    let arbiter = Arc::new(
        Arbiter::start(Arc::clone(&store), config.clone())
            .map_err(|e| format!("round {round}: arbiter failed to start: {e}"))?,
    );
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let arbiter = Arc::clone(&arbiter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let intent = ClusterExtension::new(format!("ext-{i:03}"), PACKAGE);
                barrier.wait();
                arbiter.create(&intent)
            })
        })
        .collect();

    let mut tally = Tally::default();
    let mut losers = Vec::new();
    for handle in handles {
        match handle.join().map_err(|_| format!("round {round}: writer panicked"))? {
            Ok(_) => tally.admitted += 1,
            Err(GuardError::PackageAlreadyClaimed { owner, .. }) => {
                tally.rejected += 1;
                losers.push(owner);
            }
            Err(e) if e.is_retriable() => tally.retriable += 1,
            Err(e) => {
                eprintln!("  round {round}: unexpected error: {e}");
                tally.unexpected += 1;
            }
        }
    }

    let package = PackageName::new(PACKAGE);
    let holders: Vec<_> = store
        .list()
        .map_err(|e| format!("round {round}: list failed: {e}"))?
        .items
        .into_iter()
        .filter(|obj| obj.package() == &package)
        .collect();
    if tally.admitted != 1 || holders.len() != 1 {
        return Err(format!(
            "round {round}: {} admitted, {} stored holders of {PACKAGE}",
            tally.admitted,
            holders.len()
        ));
    }
    let winner = holders[0].name();
    if let Some(wrong) = losers.iter().find(|owner| *owner != winner) {
        return Err(format!(
            "round {round}: loser was told {wrong} holds {PACKAGE}, store says {winner}"
        ));
    }
    Ok(tally)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let rounds: usize = arg_value(&args, "--rounds")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    let writers: usize = arg_value(&args, "--writers")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let arbitration = match arg_value(&args, "--mode") {
        Some("store") => Arbitration::Store,
        _ => Arbitration::Local,
    };
    let durable = args.iter().any(|a| a == "--durable");

    let config = GuardConfig {
        arbitration,
        initial_sync_timeout_ms: 2000,
        ..GuardConfig::default()
    };

    println!(
        "extguard race stress: {rounds} rounds x {writers} writers, arbitration {arbitration:?}{}",
        if durable { ", durable store" } else { "" }
    );
    println!("============================================");

    let start = Instant::now();
    let mut failures = 0u64;
    let mut totals = Tally::default();
    for round in 1..=rounds {
        match run_round(round, writers, &config, durable) {
            Ok(t) => {
                totals.admitted += t.admitted;
                totals.rejected += t.rejected;
                totals.retriable += t.retriable;
                totals.unexpected += t.unexpected;
            }
            Err(msg) => {
                eprintln!("  {msg}");
                failures += 1;
            }
        }
        if round.is_multiple_of(10) {
            println!(
                "  round {round}/{rounds}: {:.1}s elapsed, {failures} failures",
                start.elapsed().as_secs_f64()
            );
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("============================================");
    println!("Results: {rounds} rounds, {failures} failures");
    println!(
        "  admitted: {}, rejected: {}, retriable: {}, unexpected: {}",
        totals.admitted, totals.rejected, totals.retriable, totals.unexpected
    );
    println!(
        "  {:.3}s total, {:.3}ms per round",
        elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / rounds.max(1) as f64
    );

    if failures > 0 || totals.unexpected > 0 {
        eprintln!("\nRACE STRESS FAILED");
        std::process::exit(1);
    } else {
        println!("\nRACE STRESS PASSED");
    }
}

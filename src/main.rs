// src/main.rs
use krati_core::{Store, StoreConfig};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic SCN source for the REPL: every mutating command gets the
/// next tick, matching the single-writer, non-decreasing-SCN contract.
static NEXT_SCN: AtomicU64 = AtomicU64::new(1);

fn next_scn() -> u64 {
    NEXT_SCN.fetch_add(1, Ordering::Relaxed)
}

fn main() {
    let capacity: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4096);

    let config = StoreConfig::new("db", capacity);
    let mut store = Store::open(config).expect("failed to open store");

    println!("krati-repl (capacity={capacity}, type help for instructions)");

    loop {
        print!("> ");
        io::stdout().flush().unwrap();
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            continue;
        }
        if input.is_empty() {
            break;
        }

        let mut parts = input.trim().splitn(3, ' ');
        let cmd = match parts.next() {
            Some(c) if !c.is_empty() => c,
            _ => continue,
        };

        match cmd {
            "set" => {
                let (index, value) = match (parts.next(), parts.next()) {
                    (Some(i), Some(v)) => (i, v),
                    _ => {
                        println!("Usage: set <index> <value>");
                        continue;
                    }
                };
                let index: u64 = match index.parse() {
                    Ok(i) => i,
                    Err(_) => {
                        println!("index must be an integer");
                        continue;
                    }
                };
                match store.set(index, value.as_bytes(), next_scn()) {
                    Ok(()) => println!("OK"),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "get" => {
                let index: u64 = match parts.next().and_then(|s| s.parse().ok()) {
                    Some(i) => i,
                    None => {
                        println!("Usage: get <index>");
                        continue;
                    }
                };
                match store.get(index) {
                    Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                    Ok(None) => println!("index not set"),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "delete" => {
                let index: u64 = match parts.next().and_then(|s| s.parse().ok()) {
                    Some(i) => i,
                    None => {
                        println!("Usage: delete <index>");
                        continue;
                    }
                };
                match store.delete(index, next_scn()) {
                    Ok(()) => println!("Deleted"),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "sync" => match store.sync() {
                Ok(()) => println!("Synced"),
                Err(e) => println!("Sync error: {}", e),
            },

            "compact" => match store.compact_to_fixpoint() {
                Ok(rounds) => println!("Compaction finished ({rounds} segment(s) migrated)"),
                Err(e) => println!("Compaction error: {}", e),
            },

            "stats" => println!("{}", store.stats()),

            "help" => print_help(),
            "quit" | "exit" => break,

            other => println!("Unknown command: '{}'", other),
        }
    }

    if let Err(e) = store.close() {
        eprintln!("error closing store: {}", e);
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  set <index> <value>");
    println!("  get <index>");
    println!("  delete <index>");
    println!("  sync");
    println!("  compact");
    println!("  stats");
    println!("  help");
    println!("  quit / exit");
}

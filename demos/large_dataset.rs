use krati_core::{Store, StoreConfig};
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Large Dataset Example ===\n");

    let config = StoreConfig::new("large_dataset_example", 10_000);
    let mut store = Store::open(config)?;

    println!("Inserting 10,000 indices...");
    let start = Instant::now();
    for i in 0..10_000u64 {
        let value = format!("user data for id {}", i);
        store.set(i, value.as_bytes(), i + 1)?;

        if (i + 1) % 2000 == 0 {
            println!("  {} indices inserted...", i + 1);
        }
    }
    let insert_duration = start.elapsed();
    println!("insertion completed in {:.2}s", insert_duration.as_secs_f64());

    println!("\nReading 1,000 indices...");
    let start = Instant::now();
    for i in (0..10_000u64).step_by(10) {
        let _ = store.get(i)?;
    }
    let read_duration = start.elapsed();
    println!("read completed in {:.2}s", read_duration.as_secs_f64());

    store.sync()?;
    println!("\nfinal statistics:");
    println!("{}", store.stats());

    println!("\nperformance:");
    println!(
        "  insert rate: {:.0} ops/sec",
        10_000.0 / insert_duration.as_secs_f64()
    );
    println!(
        "  read rate: {:.0} ops/sec",
        1_000.0 / read_duration.as_secs_f64()
    );

    Ok(())
}

use krati_core::{Store, StoreConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Compaction Example ===\n");

    let mut config = StoreConfig::new("compaction_example", 100);
    config.segment_file_size_mb = 1;
    let mut store = Store::open(config)?;

    println!("Writing 100 indices, 10 versions each...");
    let mut scn = 0u64;
    for round in 0..10 {
        for i in 0..100u64 {
            scn += 1;
            let value = format!("value_{}_{}", i, round);
            store.set(i, value.as_bytes(), scn)?;
        }
        println!("  round {} completed", round + 1);
    }
    store.sync()?;

    let sample = store.get(0)?;
    assert_eq!(
        sample,
        Some(b"value_0_9".to_vec()),
        "index 0 should hold the last round's value"
    );

    let stats_before = store.stats();
    println!("\nBefore compaction:");
    println!("  segments: {}", stats_before.num_segments);
    println!("  bytes: {:.2} MB", stats_before.total_mb());

    println!("\nCompacting...");
    store.compact_to_fixpoint()?;
    store.sync()?;
    // A second pass lets any reclaim gated on the now-advanced LWM run.
    store.compact_to_fixpoint()?;

    let stats_after = store.stats();
    println!("\nAfter compaction:");
    println!("  segments: {}", stats_after.num_segments);
    println!("  bytes: {:.2} MB", stats_after.total_mb());

    for i in 0..100u64 {
        let value = store.get(i)?;
        assert_eq!(
            value,
            Some(format!("value_{}_9", i).as_bytes().to_vec()),
            "index {i} should survive compaction"
        );
    }
    println!("\nall 100 indices verified - data integrity preserved");

    Ok(())
}

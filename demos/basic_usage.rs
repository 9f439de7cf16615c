//! Basic usage example for `krati-core`.

use krati_core::{Store, StoreConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Basic Usage: krati-core ===");

    let config = StoreConfig::new("example_store", 16);
    let mut store = Store::open(config)?;

    // indices 0 and 1 hold user #1's fields, 2 and 3 hold user #2's
    store.set(0, b"Alice", 1)?;
    store.set(1, b"alice@example.com", 2)?;
    store.set(2, b"Bob", 3)?;
    store.set(3, b"bob@example.com", 4)?;

    let name = store.get(0)?;
    assert_eq!(name, Some(b"Alice".to_vec()), "should retrieve Alice's name");
    println!("index 0: {}", String::from_utf8_lossy(&name.unwrap()));

    let email = store.get(1)?;
    assert_eq!(
        email,
        Some(b"alice@example.com".to_vec()),
        "should retrieve Alice's email"
    );
    println!("index 1: {}", String::from_utf8_lossy(&email.unwrap()));

    store.delete(3, 5)?;
    let deleted_email = store.get(3)?;
    assert_eq!(deleted_email, None, "index 3 should be deleted");
    println!("deleted index 3");

    let bob_name = store.get(2)?;
    assert_eq!(bob_name, Some(b"Bob".to_vec()), "index 2 should still exist");

    store.sync()?;
    println!("{}", store.stats());

    Ok(())
}

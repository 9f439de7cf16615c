use krati_core::{Store, StoreConfig};

const SESSION: u64 = 0;
const COUNTER: u64 = 1;
const NAME: u64 = 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Persistence Example ===");

    // Session 1: write values and sync before close.
    {
        let mut store = Store::open(StoreConfig::new("persisted_store", 8))?;
        store.set(SESSION, b"first", 1)?;
        store.set(COUNTER, b"42", 2)?;
        store.set(NAME, b"Test Store", 3)?;
        store.sync()?;
        println!("values written: session, counter, name");
    }

    // Session 2: read, modify, delete.
    {
        let mut store = Store::open(StoreConfig::new("persisted_store", 8))?;
        assert_eq!(store.get(SESSION)?, Some(b"first".to_vec()));
        assert_eq!(store.get(COUNTER)?, Some(b"42".to_vec()));
        assert_eq!(store.get(NAME)?, Some(b"Test Store".to_vec()));
        println!("all data persisted correctly from session 1");

        store.set(COUNTER, b"43", 4)?;
        println!("counter updated to 43");

        store.delete(NAME, 5)?;
        println!("name deleted");
        store.sync()?;
    }

    // Session 3: verify changes.
    {
        let store = Store::open(StoreConfig::new("persisted_store", 8))?;
        assert_eq!(store.get(SESSION)?, Some(b"first".to_vec()), "session should still persist");
        assert_eq!(store.get(COUNTER)?, Some(b"43".to_vec()), "counter should reflect update");
        assert_eq!(store.get(NAME)?, None, "name should have been deleted");
        println!("session, updated counter, and delete verified");
    }

    Ok(())
}

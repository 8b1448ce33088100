//! Basic usage example for drhdb
//!
//! Opens a database, writes to the default table and a named table,
//! commits a transaction and prints the state of the table files.

use drhdb::{Options, DB};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    let options = Options::default().partition_count(1024);
    let db = DB::open("./example_data", options)?;
    println!("Database opened successfully");

    println!("Writing data...");
    db.set(b"key1", b"value1")?;
    db.set(b"key2", b"value2")?;

    let users = db.table("users")?;
    users.set(b"alice", b"admin")?;

    println!("Reading data...");
    if let Some(value) = db.get(b"key1")? {
        println!("key1 => {:?}", String::from_utf8_lossy(&value));
    }

    // One frame in the binlog for both tables
    let mut tx = db.begin();
    tx.remove(b"key2")?.set_to(b"bob", b"guest", "users")?;
    tx.commit()?;

    match db.get(b"key2")? {
        Some(_) => println!("key2 still exists (unexpected)"),
        None => println!("key2 was successfully removed"),
    }

    db.sync()?;
    let report = users.verify()?;
    println!("users: {} items in {} lists, {:?}", report.items, report.lists, users.space());

    db.close()?;
    println!("Database closed");

    Ok(())
}

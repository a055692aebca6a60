//! Benchmark utilities.

use rand::Rng;
use sqlfile_core::{Config, Connection};
use std::path::Path;

/// Generate random row data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Open a database at `path` with the given page size and fill it with
/// `rows` random rows of `payload_size` bytes.
pub fn populated(path: &Path, page_size: u32, rows: usize, payload_size: usize) -> Connection {
    let config = Config::default().page_size(page_size).sync_on_commit(false);
    let conn = Connection::open_with_config(path, config).unwrap();
    conn.transaction(|tx| {
        for _ in 0..rows {
            tx.insert(random_data(payload_size))?;
        }
        Ok(())
    })
    .unwrap();
    conn
}

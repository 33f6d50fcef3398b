//! Coordination database connection and initialization.

pub use arena_core::db::DatabaseError;

arena_core::define_database!(CoordDatabase, "Coordination store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = CoordDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }
}

//! Row-store connection and initialization.

pub use arena_core::db::DatabaseError;

arena_core::define_database!(Database, "Row store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }
}

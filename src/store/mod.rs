pub mod repo;
pub mod sqlite;

pub use repo::EmailRepository;
pub use sqlite::SqliteRepo;

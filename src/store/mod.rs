pub mod postgres;
pub mod repository;

pub use postgres::PgStore;
pub use repository::TokenRepository;

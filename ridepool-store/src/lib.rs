pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod hold_repo;
pub mod memory;
pub mod redis_repo;
pub mod route_repo;

pub use booking_repo::PgBookingRepository;
pub use database::DbClient;
pub use events::EventProducer;
pub use hold_repo::PgSeatHoldRepository;
pub use redis_repo::RedisClient;
pub use route_repo::PgCapacityProvider;

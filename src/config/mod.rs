mod settings;

pub use settings::{
    DatabaseConfig, LoggingConfig, QueueConfig, RedisConfig, ServerConfig, Settings, WorkerConfig,
};

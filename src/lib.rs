pub mod db;
pub mod probe;
pub mod scheduler;

pub mod alerting;
pub mod notifications;
pub mod server;

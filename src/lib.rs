pub mod campaign;
pub mod config;
pub mod db;
pub mod mailer;
pub mod model;
pub mod render;
pub mod scheduler;
pub mod worker;

pub mod engine;
pub mod health;

pub mod activity;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod merge;
pub mod model;
pub mod protocol;
pub mod store;
pub(crate) mod supervisor;
pub mod types;

pub mod activity;
pub mod aggregate;
pub mod config;
pub mod error;
pub mod normalize;
pub mod providers;
pub mod store;
pub mod sync;
pub mod track_export;

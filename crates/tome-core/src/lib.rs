pub mod asset;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod messages;
pub mod provider;
pub mod run;
pub mod stream;

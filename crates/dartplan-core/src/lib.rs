// Library root: tournament model and the Hub update synchronization core.

pub mod collab;
pub mod fields;
pub mod identity;
pub mod locate;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod update;

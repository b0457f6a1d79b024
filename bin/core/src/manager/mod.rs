//! Managers: the only writers of the store and the only callers
//! of the backend adapters. Schedulers and handlers go through
//! them.

pub mod appliance;
pub mod container;
pub mod task;
pub mod volume;

//! Wire and domain types shared by the DomuGrauds server crates and clients.

pub mod api;
pub mod events;
pub mod models;

pub mod delivery;
pub mod repositories;
pub mod scheduling;

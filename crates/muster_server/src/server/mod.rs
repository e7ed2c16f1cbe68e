#![forbid(unsafe_code)]

pub mod connection;
pub mod health;
pub mod notify;
pub mod registry;
pub mod room;
pub mod scheduler;
pub mod store;
pub mod worker;


#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod room_tests;


#[cfg(test)]
mod worker_tests;

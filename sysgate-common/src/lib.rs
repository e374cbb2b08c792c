//! shared pieces of the mediation layer: constants, engine
//! configuration, global statistics and logger setup.

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod consts;
pub mod logging;
pub mod state;

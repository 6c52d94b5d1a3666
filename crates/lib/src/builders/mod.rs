//! Builders shipped with the engine.

mod install;

pub use install::Install;

//! Built-in module implementations.
//!
//! `builtins` installs the global functions every script sees; `async_mod`
//! installs the `async` module. Both register through the binding layer, so
//! they exercise the same dispatch path as embedder-provided natives.

pub(crate) mod async_mod;
pub(crate) mod builtins;

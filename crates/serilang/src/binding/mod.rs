//! Native binding layer.
//!
//! Bridges script calls to host functions: a declarative [`spec::ArgSpec`]
//! describes each callable's parameter shape, [`caster`] converts between
//! values and host types, [`function`] runs the bind-then-cast-then-invoke
//! pipeline, and [`module`] provides the module/class registrars embedders
//! use.

pub mod caster;
pub mod function;
pub mod module;
pub mod spec;

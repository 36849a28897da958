//! Binary-crate glue: configuration loading shared by the `depshard`
//! service and the `depshard-admin` operator CLI. The actual component
//! crates (`depshard-core`, `depshard-transport`, `depshard-consensus`,
//! `depshard-resilience`, `depshard-endorser`) carry the specification;
//! this crate only wires them together behind a binary boundary.

pub mod config;

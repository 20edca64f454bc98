//! A small JVM bytecode interpreter.
//!
//! The crate is split along the lifecycle of a program: [`jvm`] parses
//! `.class` files, [`program`] turns them into their run-time
//! representation, and [`runtime`] executes them over the operand
//! [`stack`] and object [`heap`], decoding instructions listed in
//! [`bytecode`].
pub mod bytecode;
pub mod heap;
pub mod jvm;
pub mod program;
pub mod runtime;
pub mod stack;

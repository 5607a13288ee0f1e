//! Rule expression grammar and signal bus (spec §4.8, §6.5).

pub mod ast;
pub mod bus;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use bus::SignalBus;

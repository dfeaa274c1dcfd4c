#![doc = include_str!("../README.md")]

pub use crate::clock::{ClockClass, ClockValue};
pub use crate::error::Error;
pub use crate::event::EventClass;
pub use crate::field::Field;
pub use crate::parser::{PacketDecoder, Parser};
pub use crate::schema::*;
pub use crate::stream::{Stream, StreamClass};
pub use crate::trace::Trace;
pub use crate::types::*;
pub use crate::value::{Environment, Value};

pub mod clock;
pub mod error;
pub mod event;
pub mod field;
pub mod parser;
pub mod schema;
pub mod stream;
pub mod trace;
pub mod types;
pub mod value;
pub mod writer;

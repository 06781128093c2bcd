//! Wire protocol: marker syntax, streaming lexer and event parser.

mod lexer;
mod parser;
mod syntax;

pub use lexer::{Lexer, Span};
pub use parser::{Parsed, Parser, TextKind, parse};
pub use syntax::{Marker, Syntax};

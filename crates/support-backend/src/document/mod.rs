pub mod chunker;
pub mod parser;

pub use chunker::TextChunker;
pub use parser::{CaptioningProvider, DocumentParser, NullCaptioningProvider, ParsedDocument};

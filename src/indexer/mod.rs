//! Document ingestion: text extraction, chunking (optionally by SOAP
//! section) and the pipeline that feeds chunks into a client's index.
pub mod chunker;
pub mod extract;
pub mod pipeline;
pub mod soap;

pub use chunker::{Chunker, TextChunk};
pub use extract::{DefaultExtractor, ExtractError, TextExtractor};
pub use pipeline::{IngestReport, IngestionPipeline};
pub use soap::Section;

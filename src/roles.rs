//! The pipeline's work units: probe emission, stamp collection, reply
//! collection and result writing.

mod emitter;
mod replies;
mod stamper;
mod writer;

pub use emitter::Emitter;
pub use replies::ReplyCollector;
pub use stamper::Stamper;
pub use writer::Writer;

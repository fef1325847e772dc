pub mod payload_sink;
pub mod recorder;

pub use payload_sink::{FilePayloadSink, PayloadSink, SinkChannel};
pub use recorder::StreamRecorder;

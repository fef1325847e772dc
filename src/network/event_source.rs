use crate::error_handling::types::CaptureError;

use super::types::FlowEvent;

/// A single-pass, in-order supplier of flow events.
///
/// `Ok(None)` signals end of input. Implementations report still-open TCP
/// connections with an `Exiting` event before returning it.
pub trait EventSource {
    fn next_event(&mut self) -> Result<Option<FlowEvent>, CaptureError>;
}

/// Replays a prepared sequence of events.
impl EventSource for std::vec::IntoIter<FlowEvent> {
    fn next_event(&mut self) -> Result<Option<FlowEvent>, CaptureError> {
        Ok(self.next())
    }
}

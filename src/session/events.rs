//! The single event stream a call session consumes.
//!
//! Every externally triggered occurrence is funneled through one
//! channel into the session's `run()` loop, which is the only place
//! session state is mutated.

use crate::core::stt::SttStreamEvent;
use crate::core::transport::InboundFrame;
use crate::core::tts::SynthesisEvent;

/// One externally triggered session event.
#[derive(Debug)]
pub enum SessionEvent {
    /// A parsed frame off the telephony socket
    Frame(InboundFrame),
    /// The telephony socket closed without a `stop` frame
    TransportClosed,
    /// Recognition stream lifecycle or transcript
    Recognition(SttStreamEvent),
    /// Synthesis stream output, tagged with the response it belongs to
    /// so events from a cancelled response are discarded
    Synthesis { seq: u64, event: SynthesisEvent },
}

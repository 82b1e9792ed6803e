//! Executor for logical APDU exchanges
//!
//! An executor turns one [`Command`] into one reassembled [`Response`], however many physical
//! exchanges that takes underneath.

use core::fmt;

use tracing::{Level, debug, info, instrument, warn};

use crate::Result;
use crate::command::Command;
use crate::response::Response;

/// Trait for APDU command execution
pub trait Executor: Send + fmt::Debug {
    /// Transmit an APDU command
    ///
    /// This method handles protocol details such as command and response chaining.
    /// Status words are returned, not turned into errors.
    #[instrument(level = "trace", skip_all, fields(cla = command.cla, ins = command.ins))]
    fn transmit(&mut self, command: &Command) -> Result<Response> {
        let response = self.do_transmit(command);
        match &response {
            Ok(response) => log_response(response),
            Err(err) => {
                debug!(error = ?err, "Error during transmission");
            }
        }
        response
    }

    /// Internal implementation of transmit
    fn do_transmit(&mut self, command: &Command) -> Result<Response>;
}

/// Log a reassembled response at the level its status word calls for
fn log_response(response: &Response) {
    let status = response.status;
    let data_len = response.data.len();
    match status.tracing_level() {
        Level::WARN => {
            warn!(%status, description = status.description(), data_len, "Received response");
        }
        Level::INFO => {
            info!(%status, description = status.description(), data_len, "Received response");
        }
        _ => debug!(%status, data_len, "Received response"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::span::{Attributes, Id, Record};
    use tracing::{Event, Metadata, Subscriber};

    use super::*;
    use crate::chain::ChainedTransport;
    use crate::transport::MockTransport;

    /// Collects the level of every event emitted by this module
    #[derive(Debug, Clone, Default)]
    struct LevelRecorder(Arc<Mutex<Vec<Level>>>);

    impl Subscriber for LevelRecorder {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &Attributes<'_>) -> Id {
            Id::from_u64(1)
        }

        fn record(&self, _span: &Id, _values: &Record<'_>) {}

        fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

        fn event(&self, event: &Event<'_>) {
            if event.metadata().target() == "keylink_apdu_core::executor" {
                self.0.lock().push(*event.metadata().level());
            }
        }

        fn enter(&self, _span: &Id) {}

        fn exit(&self, _span: &Id) {}
    }

    fn response_levels(raw: &'static [u8]) -> Vec<Level> {
        let recorder = LevelRecorder::default();
        let mut executor = ChainedTransport::new(MockTransport::new([raw]));

        tracing::subscriber::with_default(recorder.clone(), || {
            executor.transmit(&Command::new(0x00, 0xB0, 0x00, 0x00)).unwrap();
        });

        recorder.0.lock().clone()
    }

    #[test]
    fn test_response_logged_at_status_level() {
        assert_eq!(response_levels(&[0x90, 0x00]), vec![Level::DEBUG]);
        assert_eq!(response_levels(&[0x62, 0x82]), vec![Level::INFO]);
        assert_eq!(response_levels(&[0x6A, 0x82]), vec![Level::WARN]);
    }
}

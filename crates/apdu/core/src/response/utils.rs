//! Utility functions for APDU response handling

use tracing::debug;

use crate::error::ResponseError;
use crate::response::status::StatusWord;

/// Extract status word and payload from raw APDU response data
///
/// The status word is always the last two bytes; everything before it is payload.
///
/// # Errors
/// Returns an error if the data is too short to contain a valid status word.
pub fn extract_response_parts(data: &[u8]) -> Result<(StatusWord, &[u8]), ResponseError> {
    match data {
        [payload @ .., sw1, sw2] => Ok((StatusWord::new(*sw1, *sw2), payload)),
        _ => {
            debug!("Response too short: {} bytes", data.len());
            Err(ResponseError::TruncatedResponse(data.len()))
        }
    }
}

//! APDU command definitions
//!
//! This module provides the command APDU according to ISO/IEC 7816-4 together with its
//! short and extended wire encodings.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CommandError;

/// Expected length type for APDU commands
///
/// In short form `0` and `256` both encode as `0x00` ("up to 256 bytes"). In extended form
/// `0` encodes as `0x0000` ("up to 65536 bytes").
pub type ExpectedLength = u16;

/// CLA bit marking every segment of a chained command except the last
pub const CHAINING_BIT: u8 = 0x10;

/// Largest data field of a short APDU
pub const MAX_SHORT_DATA: usize = 255;

/// Largest data field of an extended APDU
pub const MAX_EXTENDED_DATA: usize = 65535;

/// Wire encoding of the Lc/Le fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApduFormat {
    /// One-byte Lc and Le
    #[default]
    Short,
    /// Three-byte Lc (`00 hi lo`) and two or three-byte Le
    Extended,
}

impl ApduFormat {
    /// Largest data field this format can carry
    pub const fn max_data_len(self) -> usize {
        match self {
            Self::Short => MAX_SHORT_DATA,
            Self::Extended => MAX_EXTENDED_DATA,
        }
    }
}

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data, empty when absent
    pub data: Bytes,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Bytes::new(),
            le: None,
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = data.into();
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Replace the class byte
    pub const fn with_cla(mut self, cla: u8) -> Self {
        self.cla = cla;
        self
    }

    /// The four header bytes CLA INS P1 P2
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Reject commands a caller is not allowed to hand to the transport
    ///
    /// The chaining bit belongs to the chained transport and must be clear.
    pub const fn validate(&self) -> Result<(), CommandError> {
        if self.cla & CHAINING_BIT != 0 {
            return Err(CommandError::ReservedChainingBit(self.cla));
        }
        Ok(())
    }

    /// Smallest format able to carry this command
    pub fn format(&self) -> ApduFormat {
        let le_fits = self.le.is_none_or(|le| le <= 256);
        if self.data.len() <= MAX_SHORT_DATA && le_fits {
            ApduFormat::Short
        } else {
            ApduFormat::Extended
        }
    }

    /// Serialize using the smallest format that fits
    pub fn try_to_bytes(&self) -> Result<Bytes, CommandError> {
        self.to_bytes_with(self.format())
    }

    /// Serialize using the given format
    ///
    /// In short form an Le above 256 is sent as `0x00`, the largest short request.
    pub fn to_bytes_with(&self, format: ApduFormat) -> Result<Bytes, CommandError> {
        let max = format.max_data_len();
        if self.data.len() > max {
            return Err(CommandError::DataTooLong {
                actual: self.data.len(),
                max,
            });
        }

        let mut buffer = BytesMut::with_capacity(self.data.len() + 9);
        buffer.put_slice(&self.header());

        match format {
            ApduFormat::Short => {
                if !self.data.is_empty() {
                    buffer.put_u8(self.data.len() as u8);
                    buffer.put_slice(&self.data);
                }
                if let Some(le) = self.le {
                    buffer.put_u8(if le >= 256 { 0 } else { le as u8 });
                }
            }
            ApduFormat::Extended => {
                if !self.data.is_empty() {
                    buffer.put_u8(0x00);
                    buffer.put_u16(self.data.len() as u16);
                    buffer.put_slice(&self.data);
                }
                if let Some(le) = self.le {
                    // Without a body the extended Le carries its own 00 marker
                    if self.data.is_empty() {
                        buffer.put_u8(0x00);
                    }
                    buffer.put_u16(le);
                }
            }
        }

        Ok(buffer.freeze())
    }

    /// Parse a short-form command from raw bytes
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CommandError> {
        let [cla, ins, p1, p2, body @ ..] = raw else {
            return Err(CommandError::InvalidLength(raw.len()));
        };

        let mut command = Self::new(*cla, *ins, *p1, *p2);
        match body {
            [] => {}
            [le] => command.le = Some(short_le(*le)),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if lc == 0 || rest.len() < lc || rest.len() > lc + 1 {
                    return Err(CommandError::InvalidLength(raw.len()));
                }
                command.data = Bytes::copy_from_slice(&rest[..lc]);
                if let Some(le) = rest.get(lc) {
                    command.le = Some(short_le(*le));
                }
            }
        }

        Ok(command)
    }
}

const fn short_le(byte: u8) -> ExpectedLength {
    if byte == 0 { 256 } else { byte as ExpectedLength }
}

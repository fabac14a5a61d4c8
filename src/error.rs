use core::fmt;

/// Errors returned by the mesh stack.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// Frames shorter than the relevant header are dropped silently by the
    /// receive path; this variant surfaces only from explicit parse calls.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when a payload does not fit into a frame buffer, and
    /// also when reaching EOF prematurely while reading data from a buffer.
    Eof,

    /// All transmit slots toward the radio are occupied.
    BufferFull,

    /// The operation requires an enrolled device, but the device has not
    /// joined a fabric yet.
    NotJoined,

    /// The operation is only available on the PAN coordinator.
    NotPan,

    /// No route exists toward the requested destination.
    NoRoute,

    /// Addressing an end device from an end device is not allowed.
    InvalidAddress,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::BufferFull => "transmit buffer full",
            Error::NotJoined => "device has not joined a fabric",
            Error::NotPan => "operation restricted to the PAN coordinator",
            Error::NoRoute => "no route to destination",
            Error::InvalidAddress => "end devices cannot address end devices",
        })
    }
}

impl std::error::Error for Error {}

//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the (de)serialization traits [`ToBytes`] and
//! [`FromBytes`], as well as the helper structs [`ByteWriter`] and
//! [`ByteReader`], which wrap a `&mut [u8]` or `&[u8]` and offer utilities to
//! read and write values.
//!
//! All structures that end up getting transmitted over the air implement
//! [`ToBytes`] and [`FromBytes`]: the link-layer frame header, the network
//! header, and the payloads of the join, move and routing messages.

use crate::Error;
use core::{cmp, mem};

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods on this type will return `Error::Eof` when the
/// underlying buffer slice is full.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Consumes `self` and returns the part of the contained buffer that has
    /// not yet been written to.
    pub fn into_rest(self) -> &'a mut [u8] {
        self.0
    }

    /// Skips the given number of bytes in the output data without writing
    /// anything there.
    ///
    /// The skipped bytes keep whatever contents the underlying buffer had;
    /// use this only when the skipped range is filled in elsewhere or is
    /// insignificant on the wire (padding).
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.space_left() < bytes {
            Err(Error::Eof)
        } else {
            let this = mem::replace(&mut self.0, &mut []);
            self.0 = &mut this[bytes..];
            Ok(())
        }
    }

    /// Returns the number of bytes that can be written to `self` until it is
    /// full.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Writes all bytes from `other` to `self`.
    ///
    /// Returns `Error::Eof` when `self` does not have enough space left to fit
    /// `other`. In that case, `self` will not be modified.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::replace(&mut self.0, &mut []);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes as many bytes as can fit from `other` into `self`.
    ///
    /// Returns the number of bytes written.
    pub fn write_slice_truncate(&mut self, other: &[u8]) -> usize {
        let num = cmp::min(self.space_left(), other.len());
        let other = &other[..num];
        self.write_slice(other).unwrap();
        num
    }

    /// Writes a single byte to `self`.
    ///
    /// Returns `Error::Eof` when no space is left.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        if self.0.is_empty() {
            return Err(Error::Eof);
        }
        self.0[0] = byte;
        let this = mem::replace(&mut self.0, &mut []);
        self.0 = &mut this[1..];
        Ok(())
    }

    /// Writes a `u16` to `self`, using big-endian byte order.
    pub fn write_u16_be(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes a `u32` to `self`, using big-endian byte order.
    pub fn write_u32_be(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_be_bytes())
    }
}

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns a reference to the raw bytes in `self`, without advancing
    /// `self` or reading any data.
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        self.0
    }

    /// Consumes `self` and returns the part of the contained buffer that has
    /// not yet been read from.
    pub fn into_rest(self) -> &'a [u8] {
        self.0
    }

    /// Skips the given number of bytes in the input data without inspecting
    /// them.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.bytes_left() < bytes {
            Err(Error::Eof)
        } else {
            self.0 = &self.0[bytes..];
            Ok(())
        }
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a byte slice of length `len` from `self`.
    ///
    /// If `self` contains less than `len` bytes, `Error::Eof` will be returned
    /// and `self` will not be modified.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a byte-array-like type `S` from `self`.
    ///
    /// `S` must implement `Default` and `AsMut<[u8]>`, which allows using
    /// small arrays as well as datastructures from `alloc`.
    pub fn read_array<S>(&mut self) -> Result<S, Error>
    where
        S: Default + AsMut<[u8]>,
    {
        let mut buf = S::default();
        let slice = buf.as_mut();
        if self.bytes_left() < slice.len() {
            return Err(Error::Eof);
        }

        slice.copy_from_slice(&self.0[..slice.len()]);
        self.0 = &self.0[slice.len()..];
        Ok(buf)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    /// Reads a single byte from `self`.
    ///
    /// Returns `Error::Eof` when `self` is empty.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<[u8; 1]>()?[0])
    }

    /// Reads a `u16` from `self`, using big-endian byte order.
    pub fn read_u16_be(&mut self) -> Result<u16, Error> {
        let arr = self.read_array::<[u8; 2]>()?;
        Ok(u16::from_be_bytes(arr))
    }

    /// Reads a `u32` from `self`, using big-endian byte order.
    pub fn read_u32_be(&mut self) -> Result<u32, Error> {
        let arr = self.read_array::<[u8; 4]>()?;
        Ok(u32::from_be_bytes(arr))
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing
    /// `writer` to point past the encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned
    /// and the state of the buffer is unspecified (eg. `self` may be partially
    /// written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the
    /// data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an
    /// insufficient number of bytes, an error will be returned and the state
    /// of `bytes` is unspecified (it can point to arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

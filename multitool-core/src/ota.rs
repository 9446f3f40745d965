//! Firmware update session.
//!
//! The image is streamed into the inactive partition as it arrives. Every
//! flash write goes through the [`FlashGate`] so the control core is parked
//! outside any lock while the cache is disabled. Nothing is activated until
//! the whole image has been written and read back intact.

use crate::crc::Crc32;
use crate::error::OtaError;
use crate::flash::FlashGate;
use crate::lock::Clock;

/// First byte of every ESP application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

const READBACK_CHUNK: usize = 256;

/// Where a new image is written before it is activated.
pub trait StagingArea {
    fn capacity(&self) -> usize;

    /// Prepare the area for `len` bytes (typically erase).
    fn begin(&mut self, len: usize) -> Result<(), OtaError>;

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtaError>;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), OtaError>;

    /// Mark the staged image as the one to boot next.
    fn activate(&mut self) -> Result<(), OtaError>;
}

pub struct OtaSession {
    expected: usize,
    written: usize,
    crc: Crc32,
}

impl OtaSession {
    /// Start a session for an image of `declared` bytes.
    pub fn begin<A, C>(
        staging: &mut A,
        gate: &FlashGate,
        clock: &C,
        declared: usize,
    ) -> Result<Self, OtaError>
    where
        A: StagingArea,
        C: Clock + ?Sized,
    {
        if declared == 0 {
            return Err(OtaError::MissingLength);
        }
        if declared > staging.capacity() {
            return Err(OtaError::TooLarge);
        }
        gate.with_parked(clock, || staging.begin(declared))
            .ok_or(OtaError::Handshake)??;
        log::info!("ota: receiving {} bytes", declared);
        Ok(Self {
            expected: declared,
            written: 0,
            crc: Crc32::new(),
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.expected
    }

    pub fn write<A, C>(
        &mut self,
        staging: &mut A,
        gate: &FlashGate,
        clock: &C,
        chunk: &[u8],
    ) -> Result<(), OtaError>
    where
        A: StagingArea,
        C: Clock + ?Sized,
    {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.written + chunk.len() > self.expected {
            return Err(OtaError::Overrun);
        }
        if self.written == 0 && chunk[0] != IMAGE_MAGIC {
            return Err(OtaError::BadMagic);
        }
        let offset = self.written;
        gate.with_parked(clock, || staging.write(offset, chunk))
            .ok_or(OtaError::Handshake)??;
        self.crc.update(chunk);
        self.written += chunk.len();
        Ok(())
    }

    /// Verify what landed in flash and activate it. The caller restarts after
    /// answering the request.
    pub fn finish<A, C>(
        self,
        staging: &mut A,
        gate: &FlashGate,
        clock: &C,
    ) -> Result<usize, OtaError>
    where
        A: StagingArea,
        C: Clock + ?Sized,
    {
        if self.written != self.expected {
            return Err(OtaError::Truncated);
        }

        let mut readback = Crc32::new();
        let mut buf = [0u8; READBACK_CHUNK];
        let mut offset = 0;
        while offset < self.written {
            let n = (self.written - offset).min(READBACK_CHUNK);
            staging.read(offset, &mut buf[..n])?;
            readback.update(&buf[..n]);
            offset += n;
        }
        if readback.finish() != self.crc.finish() {
            log::error!("ota: read-back CRC mismatch");
            return Err(OtaError::Corrupt);
        }

        gate.with_parked(clock, || staging.activate())
            .ok_or(OtaError::Handshake)??;
        log::info!("ota: {} bytes verified, image activated", self.written);
        Ok(self.written)
    }
}

const HEADER_LEN: usize = 24;
const SEGMENT_HEADER_LEN: usize = 8;
const HASH_APPENDED_AT: usize = 23;
const APPENDED_HASH_LEN: usize = 32;
const MAX_SEGMENTS: u8 = 16;

/// Length of an app image as it sits in flash: header, segments, the checksum
/// byte padded to a 16-byte boundary and the optional appended SHA-256.
///
/// `read` fills a buffer from the given image offset. Returns `None` when the
/// bytes at offset 0 are not an app image.
pub fn image_len<E>(
    mut read: impl FnMut(usize, &mut [u8]) -> Result<(), E>,
) -> Result<Option<usize>, E> {
    let mut header = [0u8; HEADER_LEN];
    read(0, &mut header)?;
    if header[0] != IMAGE_MAGIC || header[1] == 0 || header[1] > MAX_SEGMENTS {
        return Ok(None);
    }

    let mut offset = HEADER_LEN;
    for _ in 0..header[1] {
        let mut segment = [0u8; SEGMENT_HEADER_LEN];
        read(offset, &mut segment)?;
        let len = u32::from_le_bytes([segment[4], segment[5], segment[6], segment[7]]) as usize;
        offset += SEGMENT_HEADER_LEN + len;
    }
    // Checksum byte, placed so the image ends on a 16-byte boundary.
    offset = (offset + 16) & !15;
    if header[HASH_APPENDED_AT] == 1 {
        offset += APPENDED_HASH_LEN;
    }
    Ok(Some(offset))
}

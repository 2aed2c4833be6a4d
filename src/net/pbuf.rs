//! Reference-counted, chainable packet buffers.
//!
//! A [`Pbuf`] holds one segment of inbound socket payload. Segments can be
//! linked into a chain that represents one logical payload split across
//! allocations; every read helper walks the chain transparently.
//!
//! # Ownership
//!
//! A `Pbuf` handle is one reference. [`Pbuf::reference`] takes another one,
//! [`Pbuf::free`] gives one back, and storage is released when the last
//! handle goes away. When the engine hands a buffer to a connection listener
//! it keeps its own handle and frees it after the callback returns, so a
//! listener that wants the payload afterwards must call `reference()`.
//!
//! ```ignore
//! let head = Pbuf::from_slice(b"hello ");
//! head.cat(Pbuf::from_slice(b"world"))?;
//! assert_eq!(head.length(true), 11);
//! assert_eq!(head.memfind(b"world", 0), Some(6));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};

// ============================================================================
// Pbuf
// ============================================================================

/// Shared state of one segment.
struct PbufInner {
    /// Segment payload.
    payload: Mutex<BytesMut>,
    /// Next segment in the chain.
    next: Mutex<Option<Pbuf>>,
    /// Source address for datagram payloads.
    remote: Mutex<Option<SocketAddr>>,
}

/// Reference-counted packet buffer segment.
///
/// Cloning is the same as [`Pbuf::reference`].
#[derive(Clone)]
pub struct Pbuf {
    inner: Arc<PbufInner>,
}

impl fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pbuf")
            .field("len", &self.len())
            .field("tot_len", &self.length(true))
            .field("ref_count", &self.ref_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Pbuf - Allocation & Reference Counting
// ============================================================================

impl Pbuf {
    /// Allocates a zero-filled segment of `len` bytes with one reference.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes_mut(BytesMut::zeroed(len))
    }

    /// Allocates a segment holding a copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_bytes_mut(BytesMut::from(data))
    }

    fn from_bytes_mut(payload: BytesMut) -> Self {
        Self {
            inner: Arc::new(PbufInner {
                payload: Mutex::new(payload),
                next: Mutex::new(None),
                remote: Mutex::new(None),
            }),
        }
    }

    /// Takes an additional reference to this segment.
    #[inline]
    #[must_use]
    pub fn reference(&self) -> Self {
        self.clone()
    }

    /// Returns the number of live references to this segment.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Releases this reference.
    ///
    /// If it was the last one the segment is released and the chain is
    /// walked, releasing every following segment that loses its last
    /// reference. Returns the number of segments actually released.
    pub fn free(self) -> usize {
        let mut freed = 0;
        let mut cur = Some(self);

        while let Some(pbuf) = cur {
            match Arc::try_unwrap(pbuf.inner) {
                Ok(inner) => {
                    freed += 1;
                    cur = inner.next.into_inner();
                }
                // Another holder remains; dropping the Arc decrements it.
                Err(_) => break,
            }
        }

        freed
    }

    /// Returns `true` if both handles refer to the same segment.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Pbuf) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Pbuf - Chaining
// ============================================================================

impl Pbuf {
    /// Links `tail` after the last segment of this chain, taking a new
    /// reference to it. The caller keeps its own handle to `tail`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `tail` is already part of
    /// this chain.
    pub fn chain(&self, tail: &Pbuf) -> Result<()> {
        self.cat(tail.reference())
    }

    /// Links `tail` after the last segment of this chain, transferring the
    /// caller's reference into the chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `tail` is already part of
    /// this chain.
    pub fn cat(&self, tail: Pbuf) -> Result<()> {
        if self.segments().any(|seg| seg.ptr_eq(&tail))
            || tail.segments().any(|seg| seg.ptr_eq(self))
        {
            return Err(Error::invalid_argument("pbuf already in chain"));
        }

        let last = self.last_segment();
        *last.inner.next.lock() = Some(tail);
        Ok(())
    }

    /// Returns a new reference to the next segment, if any.
    #[must_use]
    pub fn next(&self) -> Option<Pbuf> {
        self.inner.next.lock().clone()
    }

    /// Iterates over every segment starting with this one.
    pub fn segments(&self) -> impl Iterator<Item = Pbuf> {
        std::iter::successors(Some(self.clone()), Pbuf::next)
    }

    fn last_segment(&self) -> Pbuf {
        self.segments().last().unwrap_or_else(|| self.clone())
    }

    /// Finds the segment that contains chain offset `offset`.
    ///
    /// Returns the segment and the offset inside it.
    #[must_use]
    pub fn skip(&self, mut offset: usize) -> Option<(Pbuf, usize)> {
        for seg in self.segments() {
            let len = seg.len();
            if offset < len {
                return Some((seg, offset));
            }
            offset -= len;
        }
        None
    }
}

// ============================================================================
// Pbuf - Length & Metadata
// ============================================================================

impl Pbuf {
    /// Returns the length of this segment only.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.payload.lock().len()
    }

    /// Returns `true` if this segment holds no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the segment length, or the whole chain length if `total`.
    #[must_use]
    pub fn length(&self, total: bool) -> usize {
        if total {
            self.segments().map(|seg| seg.len()).sum()
        } else {
            self.len()
        }
    }

    /// Records the datagram source address.
    pub fn set_remote(&self, addr: SocketAddr) {
        *self.inner.remote.lock() = Some(addr);
    }

    /// Returns the datagram source address, if recorded.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.inner.remote.lock()
    }
}

// ============================================================================
// Pbuf - Data Access
// ============================================================================

impl Pbuf {
    /// Copies `data` into the chain starting at chain offset `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the data does not fit.
    pub fn take(&self, data: &[u8], offset: usize) -> Result<()> {
        if offset + data.len() > self.length(true) {
            return Err(Error::invalid_argument(format!(
                "pbuf take of {} bytes at {} exceeds {}",
                data.len(),
                offset,
                self.length(true)
            )));
        }

        let mut remaining = data;
        let mut cursor = self.skip(offset);

        while !remaining.is_empty() {
            let Some((seg, seg_off)) = cursor else {
                break;
            };
            let written = {
                let mut payload = seg.inner.payload.lock();
                let n = remaining.len().min(payload.len() - seg_off);
                payload[seg_off..seg_off + n].copy_from_slice(&remaining[..n]);
                n
            };
            remaining = &remaining[written..];
            cursor = seg.next().map(|next| (next, 0));
        }

        Ok(())
    }

    /// Copies chain bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied.
    pub fn copy(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut copied = 0;
        let mut cursor = self.skip(offset);

        while copied < dst.len() {
            let Some((seg, seg_off)) = cursor else {
                break;
            };
            {
                let payload = seg.inner.payload.lock();
                let n = (dst.len() - copied).min(payload.len() - seg_off);
                dst[copied..copied + n].copy_from_slice(&payload[seg_off..seg_off + n]);
                copied += n;
            }
            cursor = seg.next().map(|next| (next, 0));
        }

        copied
    }

    /// Returns the byte at chain offset `pos`.
    #[must_use]
    pub fn get_at(&self, pos: usize) -> Option<u8> {
        let (seg, off) = self.skip(pos)?;
        let byte = seg.inner.payload.lock().get(off).copied();
        byte
    }

    /// Compares chain bytes at `offset` against `data`.
    ///
    /// Returns `None` when equal, otherwise the index into `data` of the
    /// first differing byte (a chain that is too short differs at the
    /// first missing byte).
    #[must_use]
    pub fn memcmp(&self, data: &[u8], offset: usize) -> Option<usize> {
        data.iter()
            .enumerate()
            .find(|&(i, &b)| self.get_at(offset + i) != Some(b))
            .map(|(i, _)| i)
    }

    /// Finds the first occurrence of `needle` at or after `offset`.
    #[must_use]
    pub fn memfind(&self, needle: &[u8], offset: usize) -> Option<usize> {
        let tot_len = self.length(true);
        if needle.is_empty() || needle.len() > tot_len {
            return None;
        }

        (offset..=tot_len - needle.len()).find(|&pos| self.memcmp(needle, pos).is_none())
    }

    /// Runs `f` with this segment's bytes.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let payload = self.inner.payload.lock();
        f(&payload)
    }

    /// Copies the whole chain into a contiguous buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.length(true));
        for seg in self.segments() {
            out.extend_from_slice(&seg.inner.payload.lock());
        }
        out.freeze()
    }
}

// ============================================================================
// Tests
// ============================================================================

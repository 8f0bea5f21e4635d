//! Per-thread scratch for streaming bytes out of a [`WindowCache`]
//! across window boundaries, plus a reusable inflater.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{OdbError, Result};
use crate::window::{ByteWindow, PackSource, WindowCache};
use std::sync::Arc;

/// Holds at most one pinned window and one inflater; callers recycle a
/// cursor across reads instead of allocating a fresh one each time
/// (spec.md §4.5 — inflaters are comparatively expensive to set up).
pub struct WindowCursor<'cache> {
    cache: &'cache WindowCache,
    pinned: Option<Arc<ByteWindow>>,
    inflater: Decompress,
}

impl<'cache> WindowCursor<'cache> {
    pub fn new(cache: &'cache WindowCache) -> Self {
        Self { cache, pinned: None, inflater: Decompress::new(true) }
    }

    fn window_for(&mut self, pack: &dyn PackSource, pos: u64) -> Result<Arc<ByteWindow>> {
        if let Some(pinned) = &self.pinned {
            let window_size = self.cache.config().packed_git_window_size as u64;
            let aligned = pos & !(window_size - 1);
            if pinned.pack() == pack.identity() && pinned.start() == aligned {
                return Ok(pinned.clone());
            }
        }
        let window = self.cache.get(pack, pos)?;
        self.pinned = Some(window.clone());
        Ok(window)
    }

    /// Copy `dst.len()` raw bytes starting at `pos`, following window
    /// boundaries transparently.
    pub fn copy(&mut self, pack: &dyn PackSource, mut pos: u64, dst: &mut [u8]) -> Result<()> {
        let mut written = 0usize;
        while written < dst.len() {
            let window = self.window_for(pack, pos)?;
            let offset_in_window = (pos - window.start()) as usize;
            let available = window.len() - offset_in_window;
            let take = available.min(dst.len() - written);
            if take == 0 {
                return Err(OdbError::CorruptObject("read past end of pack".into()));
            }
            dst[written..written + take]
                .copy_from_slice(&window.as_slice()[offset_in_window..offset_in_window + take]);
            written += take;
            pos += take as u64;
        }
        Ok(())
    }

    /// Inflate a zlib stream starting at `pos` until `dst` is full or the
    /// stream ends, returning the number of compressed bytes consumed.
    pub fn inflate(&mut self, pack: &dyn PackSource, mut pos: u64, dst: &mut [u8]) -> Result<u64> {
        self.inflater.reset(true);
        let start_pos = pos;
        let mut out_off = 0usize;

        loop {
            let window = self.window_for(pack, pos)?;
            let offset_in_window = (pos - window.start()) as usize;
            let input = &window.as_slice()[offset_in_window..];
            if input.is_empty() {
                return Err(OdbError::CorruptObject("zlib stream ran past end of pack".into()));
            }

            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self
                .inflater
                .decompress(input, &mut dst[out_off..], FlushDecompress::None)
                .map_err(|e| OdbError::CorruptObject(format!("zlib error: {e}")))?;
            let consumed = (self.inflater.total_in() - before_in) as u64;
            let produced = (self.inflater.total_out() - before_out) as usize;
            pos += consumed;
            out_off += produced;

            match status {
                Status::StreamEnd => return Ok(pos - start_pos),
                Status::BufError => {
                    return Err(OdbError::CorruptObject("zlib buffer error".into()))
                }
                Status::Ok => {
                    if out_off >= dst.len() {
                        return Ok(pos - start_pos);
                    }
                    if consumed == 0 {
                        return Err(OdbError::CorruptObject("zlib stream made no progress".into()));
                    }
                }
            }
        }
    }

    /// Inflate until end-of-stream, discarding output; returns the
    /// number of compressed bytes consumed. Used by CRC verification,
    /// which only needs to know where the next object begins.
    pub fn inflate_verify(&mut self, pack: &dyn PackSource, pos: u64) -> Result<u64> {
        self.inflater.reset(true);
        let start_pos = pos;
        let mut pos = pos;
        let mut scratch = vec![0u8; 32 * 1024];

        loop {
            let window = self.window_for(pack, pos)?;
            let offset_in_window = (pos - window.start()) as usize;
            let input = &window.as_slice()[offset_in_window..];
            if input.is_empty() {
                return Err(OdbError::CorruptObject("zlib stream ran past end of pack".into()));
            }

            let before_in = self.inflater.total_in();
            let status = self
                .inflater
                .decompress(input, &mut scratch, FlushDecompress::None)
                .map_err(|e| OdbError::CorruptObject(format!("zlib error: {e}")))?;
            let consumed = (self.inflater.total_in() - before_in) as u64;
            pos += consumed;

            match status {
                Status::StreamEnd => return Ok(pos - start_pos),
                Status::BufError => {
                    return Err(OdbError::CorruptObject("zlib buffer error".into()))
                }
                Status::Ok => {
                    if consumed == 0 {
                        return Err(OdbError::CorruptObject("zlib stream made no progress".into()));
                    }
                }
            }
        }
    }

    /// Release the pinned window without waiting for the next load to
    /// replace it.
    pub fn unpin(&mut self) {
        self.pinned = None;
    }
}

// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use bytes::Bytes;
use common::{ArcLogger, LogEntry, LogLevel};
use mp4::{patch_moof, BoxHeader, BoxType, TypeSniffer, TYPE_FTYP, TYPE_MDAT, TYPE_MOOF, TYPE_MOOV};
use thiserror::Error;

// Number of bytes the boundary detector still expects before the
// current root box is complete.
#[derive(Clone, Copy)]
enum BytesNeeded {
    AwaitingHeader,
    Exactly(u64),
}

// Accumulates bytes until a complete root-level box has been
// received. Bytes preceding the first recognizable root box are
// absorbed into that box rather than rejected.
struct BoundaryDetector {
    accum: Vec<u8>,
    sniffer: TypeSniffer,
    bytes_needed: BytesNeeded,
    bytes_received: u64,
    current_type: Option<BoxType>,
}

impl BoundaryDetector {
    fn new() -> Self {
        Self {
            accum: Vec::new(),
            sniffer: TypeSniffer::new(),
            bytes_needed: BytesNeeded::AwaitingHeader,
            bytes_received: 0,
            current_type: None,
        }
    }

    // Feeds a single byte. Returns the complete box once the
    // declared (possibly extended) size has been accumulated.
    fn push(&mut self, byte: u8) -> Option<(BoxType, Vec<u8>)> {
        self.accum.push(byte);
        self.sniffer.add(byte);
        self.bytes_received += 1;

        // A match while the size is still unknown means this is a
        // root box and not bytes inside an already sized one.
        if let (Some(box_type), BytesNeeded::AwaitingHeader) =
            (self.sniffer.classify(), self.bytes_needed)
        {
            if let Ok(header) = BoxHeader::unmarshal(&self.accum) {
                self.bytes_needed = BytesNeeded::Exactly(header.size);
                self.bytes_received =
                    u64::try_from(header.header_size).expect("header size is 8 or 16");
                self.current_type = Some(box_type);
            }
        }

        if let BytesNeeded::Exactly(needed) = self.bytes_needed {
            if self.bytes_received == needed {
                let box_type = self.current_type.take();
                let buf = std::mem::take(&mut self.accum);
                self.bytes_needed = BytesNeeded::AwaitingHeader;
                self.bytes_received = 0;
                return box_type.map(|t| (t, buf));
            }
        }
        None
    }
}

// Delivery sink for a single viewer. A sink must not call back
// into the stream it is registered with.
pub trait Sink {
    fn send(&mut self, b: Bytes);
}

// Opaque viewer registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

struct Viewer {
    id: ViewerId,
    initialized: bool,
    base_media_decode_time: u64,
    sink: Box<dyn Sink>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("patch moof: {0}")]
    PatchMoof(#[from] mp4::PatchMoofError),

    #[error("fragment pair completed before ftyp and moov were cached")]
    InitNotCached,
}

// Fans a single fMP4 elementary stream out to any number of
// viewers, rewriting each fragment's decode time so that every
// viewer's timeline starts at zero at the moment it joined and
// advances by the real duration of each delivered fragment.
//
// The input must use empty_moov+default_base_moof+frag_keyframe
// framing: one moof immediately followed by one mdat per fragment.
pub struct Mp4Stream {
    logger: ArcLogger,
    detector: BoundaryDetector,
    ftyp: Option<Bytes>,
    moov: Option<Bytes>,
    pair: Vec<Bytes>,
    viewers: Vec<Viewer>,
    viewer_id_count: u64,
}

impl Mp4Stream {
    #[must_use]
    pub fn new(logger: ArcLogger) -> Self {
        Self {
            logger,
            detector: BoundaryDetector::new(),
            ftyp: None,
            moov: None,
            pair: Vec::new(),
            viewers: Vec::new(),
            viewer_id_count: 0,
        }
    }

    // Feeds a chunk of the stream. State persists between calls,
    // so chunks may be split at arbitrary byte positions. Sinks
    // are invoked synchronously from within this call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), FeedError> {
        for byte in chunk {
            let Some((box_type, buf)) = self.detector.push(*byte) else {
                continue;
            };
            self.handle_box(box_type, buf)?;
        }
        Ok(())
    }

    fn handle_box(&mut self, box_type: BoxType, buf: Vec<u8>) -> Result<(), FeedError> {
        match box_type {
            TYPE_FTYP => self.ftyp = Some(Bytes::from(buf)),
            TYPE_MOOV => self.moov = Some(Bytes::from(buf)),
            TYPE_MOOF | TYPE_MDAT => {
                self.pair.push(Bytes::from(buf));
                if self.pair.len() == 2 {
                    // The pair is cleared even on failure so that a
                    // malformed fragment only loses itself.
                    let res = self.fan_out();
                    self.pair.clear();
                    res?;
                }
            }
            _ => {
                self.logger.log(LogEntry::new(
                    LogLevel::Error,
                    "streamer",
                    format!(
                        "discarding unexpected root box '{}'",
                        String::from_utf8_lossy(&box_type)
                    ),
                ));
            }
        }
        Ok(())
    }

    fn fan_out(&mut self) -> Result<(), FeedError> {
        let moof = self.pair[0].clone();
        let mdat = self.pair[1].clone();
        let ftyp = self.ftyp.clone();
        let moov = self.moov.clone();
        let logger = self.logger.clone();

        for viewer in &mut self.viewers {
            if !viewer.initialized {
                let (Some(ftyp), Some(moov)) = (&ftyp, &moov) else {
                    return Err(FeedError::InitNotCached);
                };
                viewer.sink.send(ftyp.clone());
                viewer.sink.send(moov.clone());
                viewer.initialized = true;
            }

            // Every viewer gets a private moof copy so that
            // patching one timeline cannot leak into another.
            let mut moof_copy = moof.to_vec();
            let duration = patch_moof(&mut moof_copy, viewer.base_media_decode_time)?;
            let duration = duration.unwrap_or_else(|| {
                logger.log(LogEntry::new(
                    LogLevel::Warning,
                    "streamer",
                    "failed to calculate fragment duration".to_owned(),
                ));
                0
            });
            viewer.base_media_decode_time += duration;
            viewer.sink.send(Bytes::from(moof_copy));
            viewer.sink.send(mdat.clone());
        }
        Ok(())
    }

    // Registers a viewer. If the init boxes are already cached
    // they are delivered synchronously before this returns.
    pub fn add_viewer(&mut self, sink: Box<dyn Sink>) -> ViewerId {
        self.viewer_id_count += 1;
        let id = ViewerId(self.viewer_id_count);

        let mut viewer = Viewer {
            id,
            initialized: false,
            base_media_decode_time: 0,
            sink,
        };
        if let (Some(ftyp), Some(moov)) = (&self.ftyp, &self.moov) {
            viewer.sink.send(ftyp.clone());
            viewer.sink.send(moov.clone());
            viewer.initialized = true;
        }
        self.viewers.push(viewer);
        id
    }

    // Takes effect for all future fragment pairs.
    pub fn remove_viewer(&mut self, id: ViewerId) -> bool {
        let Some(pos) = self.viewers.iter().position(|v| v.id == id) else {
            return false;
        };
        self.viewers.remove(pos);
        true
    }

    #[must_use]
    pub fn num_viewers(&self) -> usize {
        self.viewers.len()
    }
}

// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Incremental EBML/Matroska stream framer.
//!
//! [`StreamParser`] consumes publisher bytes in arbitrarily sized chunks and
//! emits [`StreamEvent`]s that delimit the container: initialization bytes up
//! to and including the `Tracks` element, cluster boundaries with their
//! captured prefixes, and opaque passthrough spans. It never inspects frame
//! payloads and copies nothing except the retained header and cluster-prefix
//! captures.
//!
//! The parser tolerates unknown-length `Segment` and `Cluster` elements
//! (terminated by the appearance of a sibling-level element) and a publisher
//! that reconnects and replays its initialization segment: once the header
//! has closed, a second top-level `EBML` element switches the parser into a
//! muted re-sync that swallows the replayed header through `Tracks`.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Matroska element IDs the framer recognizes, written with their length
/// marker bits as the Matroska specification prints them.
pub mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const INFO: u32 = 0x1549_A966;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CHAPTERS: u32 = 0x1043_A770;
    pub const TAGS: u32 = 0x1254_C367;
    pub const ATTACHMENTS: u32 = 0x1941_A469;
    pub const VOID: u32 = 0xEC;
    pub const CRC32: u32 = 0xBF;
}

/// Errors that make the publisher's byte stream unusable.
///
/// Once returned, the parser stays failed; further `feed` calls return
/// [`ContainerError::AlreadyFailed`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("element id is not a valid vint")]
    BadElementId,
    #[error("length vint wider than 8 bytes")]
    OversizedLength,
    #[error("stream does not begin with an EBML header")]
    MissingEbmlHeader,
    #[error("expected a segment after the EBML header, got {0:#x}")]
    MissingSegment(u32),
    #[error("element {0:#x} may not use the unknown-length sentinel")]
    UnboundedElement(u32),
    #[error("child element overruns its parent")]
    ChildOverrun,
    #[error("cluster before track metadata was complete")]
    ClusterBeforeTracks,
    #[error("cluster block before the cluster timecode")]
    BlockBeforeTimecode,
    #[error("cluster timecode is not a valid unsigned integer")]
    BadTimecode,
    #[error("initialization segment exceeds the {max} byte cap")]
    HeaderTooLarge { max: usize },
    #[error("publisher restarted the stream before completing track metadata")]
    RestartBeforeTracks,
    #[error("parser already failed")]
    AlreadyFailed,
}

/// First byte of an unknown-length size VINT, indexed by width.
const UNKNOWN_LENGTH_FIRST: [u8; 9] = [0, 0xFF, 0x7F, 0x3F, 0x1F, 0x0F, 0x07, 0x03, 0x01];

/// Events produced by [`StreamParser::feed`], in stream order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Initialization bytes, up to and including the `Tracks` element.
    Header(Bytes),
    /// The initialization segment is complete and may be frozen.
    HeaderComplete,
    /// A new cluster begins; the captured prefix covers the cluster element
    /// header through its `Timecode` child.
    ClusterStart(ClusterStart),
    /// Opaque bytes inside (or between) clusters, forwarded verbatim.
    Media(Bytes),
    /// The current cluster is finished.
    ClusterEnd,
}

/// Captured prefix of a cluster: the cluster element header, any `Void` or
/// `CRC-32` children preceding the timecode, and the `Timecode` element.
#[derive(Debug, Clone)]
pub struct ClusterStart {
    prefix: Bytes,
    timecode: u64,
    /// Offset and width of the cluster size VINT within `prefix`.
    size_span: (usize, usize),
    /// Offset and length of the `Timecode` payload within `prefix`.
    timecode_span: (usize, usize),
}

impl ClusterStart {
    /// The cluster base timestamp as sent by the publisher.
    pub const fn timecode(&self) -> u64 {
        self.timecode
    }

    /// The prefix bytes exactly as the publisher framed them.
    pub const fn prefix(&self) -> &Bytes {
        &self.prefix
    }

    /// Returns a copy of the prefix with the `Timecode` payload rewritten to
    /// `timecode - ts_offset` (saturating, same byte width).
    ///
    /// When `unbounded` is set the cluster size VINT is also rewritten to the
    /// unknown-length sentinel. Subscribers joining mid-cluster need this:
    /// their copy of the cluster is truncated, so a declared size would be a
    /// lie, while an unknown-length cluster is validly terminated by the next
    /// cluster. With `ts_offset == 0` and `unbounded` unset the original
    /// bytes are returned unchanged, preserving the identity relay.
    #[allow(clippy::cast_possible_truncation)]
    pub fn rebased(&self, ts_offset: u64, unbounded: bool) -> Bytes {
        if ts_offset == 0 && !unbounded {
            return self.prefix.clone();
        }

        let mut copy = BytesMut::from(&self.prefix[..]);
        let rebased = self.timecode.saturating_sub(ts_offset);
        let (ts_at, ts_len) = self.timecode_span;
        for i in 0..ts_len {
            copy[ts_at + i] = (rebased >> (8 * (ts_len - 1 - i))) as u8;
        }

        if unbounded {
            let (size_at, size_width) = self.size_span;
            copy[size_at] = UNKNOWN_LENGTH_FIRST[size_width];
            for byte in &mut copy[size_at + 1..size_at + size_width] {
                *byte = 0xFF;
            }
        }

        copy.freeze()
    }
}

/// A decoded size VINT.
struct Length {
    value: u64,
    width: usize,
    unknown: bool,
}

const fn vint_width(first: u8) -> usize {
    first.leading_zeros() as usize + 1
}

/// Decodes an element ID at the front of `buf`. Returns `None` when more
/// bytes are needed. IDs keep their marker bits, matching Matroska notation.
fn read_element_id(buf: &[u8]) -> Result<Option<(u32, usize)>, ContainerError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first == 0 {
        return Err(ContainerError::BadElementId);
    }
    let width = vint_width(first);
    if width > 4 {
        return Err(ContainerError::BadElementId);
    }
    if buf.len() < width {
        return Ok(None);
    }
    let mut value: u32 = 0;
    for &byte in &buf[..width] {
        value = (value << 8) | u32::from(byte);
    }
    Ok(Some((value, width)))
}

/// Decodes a size VINT at the front of `buf`. Returns `None` when more bytes
/// are needed.
fn read_length(buf: &[u8]) -> Result<Option<Length>, ContainerError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first == 0 {
        return Err(ContainerError::OversizedLength);
    }
    let width = vint_width(first);
    if buf.len() < width {
        return Ok(None);
    }
    let mut value = u64::from(first & (0xFF >> width));
    for &byte in &buf[1..width] {
        value = (value << 8) | u64::from(byte);
    }
    let unknown = value == (1u64 << (7 * width)) - 1;
    Ok(Some(Length { value, width, unknown }))
}

/// Element IDs that are valid directly under a `Segment`. Their appearance
/// terminates an unknown-length cluster.
const fn is_segment_level(element: u32) -> bool {
    matches!(
        element,
        id::EBML
            | id::SEGMENT
            | id::SEEK_HEAD
            | id::INFO
            | id::TRACKS
            | id::CLUSTER
            | id::CUES
            | id::CHAPTERS
            | id::TAGS
            | id::ATTACHMENTS
    )
}

/// Classification of a pending passthrough span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    /// Part of the initialization segment.
    Header,
    /// Live bytes forwarded to primed subscribers.
    Media,
    /// Replayed header bytes during a publisher re-sync; swallowed.
    Discard,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Expecting a top-level `EBML` element.
    Start,
    /// Streaming the `EBML` element payload.
    EbmlPayload { remaining: u64 },
    /// Expecting the `Segment` element.
    Segment,
    /// Expecting a segment-level child element.
    SegmentChild,
    /// Streaming a segment-level child's payload.
    SegmentChildPayload { remaining: u64, is_tracks: bool },
    /// Inside a cluster, collecting prefix children until the `Timecode`.
    ClusterTimecode,
    /// Inside a cluster, expecting a child element.
    ClusterChild,
    /// Streaming a cluster child's payload.
    BlockPayload { remaining: u64 },
    Failed,
}

/// Cluster prefix under construction.
#[derive(Debug)]
struct PendingCluster {
    prefix: BytesMut,
    size_span: (usize, usize),
}

/// Incremental parser over one publisher's byte stream.
#[derive(Debug)]
pub struct StreamParser {
    buf: BytesMut,
    state: State,
    /// Classification of `buf[..run_len]`, pending emission.
    run: Option<Run>,
    run_len: usize,
    header_done: bool,
    /// Swallowing a replayed initialization segment after a reconnect.
    resync: bool,
    segment_remaining: Option<u64>,
    cluster_remaining: Option<u64>,
    pending_cluster: Option<PendingCluster>,
    header_bytes: usize,
    max_header_bytes: usize,
}

impl StreamParser {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Start,
            run: None,
            run_len: 0,
            header_done: false,
            resync: false,
            segment_remaining: None,
            cluster_remaining: None,
            pending_cluster: None,
            header_bytes: 0,
            max_header_bytes,
        }
    }

    /// True once the `Tracks` element has been fully consumed.
    pub const fn header_done(&self) -> bool {
        self.header_done
    }

    /// Feeds one chunk of publisher bytes, returning the framing events it
    /// completes. Spans are coalesced so a chunk of cluster data normally
    /// produces a single [`StreamEvent::Media`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, ContainerError> {
        if matches!(self.state, State::Failed) {
            return Err(ContainerError::AlreadyFailed);
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        match self.run_to_exhaustion(&mut out) {
            Ok(()) => {
                self.flush_run(&mut out);
                Ok(out)
            }
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    fn run_to_exhaustion(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), ContainerError> {
        loop {
            let progressed = match self.state {
                State::Start => self.on_start(out)?,
                State::EbmlPayload { .. } | State::SegmentChildPayload { .. } => {
                    self.on_passthrough_payload(out)?
                }
                State::Segment => self.on_segment(out)?,
                State::SegmentChild => self.on_segment_child(out)?,
                State::ClusterTimecode => self.on_cluster_timecode(out)?,
                State::ClusterChild => self.on_cluster_child(out)?,
                State::BlockPayload { .. } => self.on_block_payload(out)?,
                State::Failed => return Err(ContainerError::AlreadyFailed),
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Bytes not yet consumed by the cursor.
    fn pending(&self) -> &[u8] {
        &self.buf[self.run_len..]
    }

    fn flush_run(&mut self, out: &mut Vec<StreamEvent>) {
        if self.run_len > 0 {
            let bytes = self.buf.split_to(self.run_len).freeze();
            self.run_len = 0;
            match self.run {
                Some(Run::Header) => out.push(StreamEvent::Header(bytes)),
                Some(Run::Media) => out.push(StreamEvent::Media(bytes)),
                Some(Run::Discard) | None => {}
            }
        }
        self.run = None;
    }

    /// Classifies the next `len` pending bytes, merging adjacent spans of the
    /// same kind.
    fn push_span(
        &mut self,
        kind: Run,
        len: usize,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), ContainerError> {
        if kind == Run::Header {
            self.header_bytes += len;
            if self.header_bytes > self.max_header_bytes {
                return Err(ContainerError::HeaderTooLarge { max: self.max_header_bytes });
            }
        }
        if self.run != Some(kind) {
            self.flush_run(out);
            self.run = Some(kind);
        }
        self.run_len += len;
        Ok(())
    }

    const fn passthrough_kind(&self) -> Run {
        if !self.header_done {
            Run::Header
        } else if self.resync {
            Run::Discard
        } else {
            Run::Media
        }
    }

    fn consume_segment(&mut self, len: u64) -> Result<(), ContainerError> {
        if let Some(remaining) = self.segment_remaining.as_mut() {
            *remaining = remaining.checked_sub(len).ok_or(ContainerError::ChildOverrun)?;
        }
        Ok(())
    }

    fn consume_cluster(&mut self, len: u64) -> Result<(), ContainerError> {
        if let Some(remaining) = self.cluster_remaining.as_mut() {
            *remaining = remaining.checked_sub(len).ok_or(ContainerError::ChildOverrun)?;
        }
        Ok(())
    }

    fn on_start(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let Some((element, id_width)) = read_element_id(self.pending())? else {
            return Ok(false);
        };
        if element != id::EBML {
            return Err(ContainerError::MissingEbmlHeader);
        }
        let Some(length) = read_length(&self.pending()[id_width..])? else {
            return Ok(false);
        };
        if length.unknown {
            return Err(ContainerError::UnboundedElement(element));
        }
        if self.header_done {
            // Publisher reconnect: the replayed header is swallowed.
            self.resync = true;
        }
        let kind = self.passthrough_kind();
        self.push_span(kind, id_width + length.width, out)?;
        self.state = State::EbmlPayload { remaining: length.value };
        Ok(true)
    }

    fn on_segment(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let Some((element, id_width)) = read_element_id(self.pending())? else {
            return Ok(false);
        };
        if element != id::SEGMENT {
            return Err(ContainerError::MissingSegment(element));
        }
        let Some(length) = read_length(&self.pending()[id_width..])? else {
            return Ok(false);
        };
        let kind = self.passthrough_kind();
        self.push_span(kind, id_width + length.width, out)?;
        self.segment_remaining = if length.unknown { None } else { Some(length.value) };
        self.state = State::SegmentChild;
        Ok(true)
    }

    /// Streams the payload of the current passthrough element; `EbmlPayload`
    /// and `SegmentChildPayload` share the logic.
    fn on_passthrough_payload(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let remaining = match self.state {
            State::EbmlPayload { remaining } | State::SegmentChildPayload { remaining, .. } => {
                remaining
            }
            _ => unreachable!("passthrough payload outside a payload state"),
        };
        let available = self.pending().len();
        let take = available.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if take > 0 {
            let kind = self.passthrough_kind();
            self.push_span(kind, take, out)?;
        }
        let left = remaining - take as u64;
        match self.state {
            State::EbmlPayload { .. } => {
                if left == 0 {
                    self.state = State::Segment;
                } else {
                    self.state = State::EbmlPayload { remaining: left };
                    return Ok(false);
                }
            }
            State::SegmentChildPayload { is_tracks, .. } => {
                if left == 0 {
                    if is_tracks {
                        if self.header_done {
                            self.resync = false;
                        } else {
                            self.flush_run(out);
                            self.header_done = true;
                            out.push(StreamEvent::HeaderComplete);
                        }
                    }
                    self.state = State::SegmentChild;
                } else {
                    self.state = State::SegmentChildPayload { remaining: left, is_tracks };
                    return Ok(false);
                }
            }
            _ => unreachable!("passthrough payload outside a payload state"),
        }
        Ok(true)
    }

    fn on_segment_child(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        if self.segment_remaining == Some(0) {
            // Known-length segment exhausted; anything further is a restart.
            self.segment_remaining = None;
            self.state = State::Start;
            return Ok(true);
        }
        let Some((element, id_width)) = read_element_id(self.pending())? else {
            return Ok(false);
        };
        if element == id::EBML {
            // Sibling terminates an unknown-length segment.
            if !self.header_done {
                return Err(ContainerError::RestartBeforeTracks);
            }
            self.state = State::Start;
            return Ok(true);
        }
        let Some(length) = read_length(&self.pending()[id_width..])? else {
            return Ok(false);
        };
        let header_len = id_width + length.width;

        if element == id::CLUSTER {
            if !self.header_done {
                return Err(ContainerError::ClusterBeforeTracks);
            }
            self.resync = false;
            self.flush_run(out);
            self.consume_segment(header_len as u64)?;
            let mut prefix = BytesMut::with_capacity(header_len + 16);
            prefix.extend_from_slice(&self.buf[..header_len]);
            self.buf.advance(header_len);
            self.pending_cluster =
                Some(PendingCluster { prefix, size_span: (id_width, length.width) });
            self.cluster_remaining = if length.unknown { None } else { Some(length.value) };
            self.state = State::ClusterTimecode;
            return Ok(true);
        }

        if length.unknown {
            return Err(ContainerError::UnboundedElement(element));
        }
        self.consume_segment(header_len as u64 + length.value)?;
        let kind = self.passthrough_kind();
        self.push_span(kind, header_len, out)?;
        self.state = State::SegmentChildPayload {
            remaining: length.value,
            is_tracks: element == id::TRACKS,
        };
        Ok(true)
    }

    fn on_cluster_timecode(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let Some((element, id_width)) = read_element_id(self.pending())? else {
            return Ok(false);
        };
        if element == id::SIMPLE_BLOCK || element == id::BLOCK_GROUP {
            return Err(ContainerError::BlockBeforeTimecode);
        }
        let Some(length) = read_length(&self.pending()[id_width..])? else {
            return Ok(false);
        };
        if length.unknown {
            return Err(ContainerError::UnboundedElement(element));
        }
        if element == id::TIMECODE && length.value > 8 {
            return Err(ContainerError::BadTimecode);
        }
        let total = id_width
            + length.width
            + usize::try_from(length.value).map_err(|_| ContainerError::ChildOverrun)?;
        let prefix_len = self.pending_cluster.as_ref().map_or(0, |p| p.prefix.len());
        if prefix_len + total > self.max_header_bytes {
            return Err(ContainerError::HeaderTooLarge { max: self.max_header_bytes });
        }
        if self.pending().len() < total {
            // Prefix children are tiny; buffer until complete.
            return Ok(false);
        }
        self.consume_segment(total as u64)?;
        self.consume_cluster(total as u64)?;

        let Some(mut pending) = self.pending_cluster.take() else {
            unreachable!("cluster prefix state without a pending cluster");
        };
        let payload_at = pending.prefix.len() + id_width + length.width;
        pending.prefix.extend_from_slice(&self.buf[..total]);
        self.buf.advance(total);

        if element == id::TIMECODE {
            #[allow(clippy::cast_possible_truncation)]
            let payload_len = length.value as usize;
            let mut timecode: u64 = 0;
            for &byte in &pending.prefix[payload_at..payload_at + payload_len] {
                timecode = (timecode << 8) | u64::from(byte);
            }
            self.flush_run(out);
            out.push(StreamEvent::ClusterStart(ClusterStart {
                prefix: pending.prefix.freeze(),
                timecode,
                size_span: pending.size_span,
                timecode_span: (payload_at, payload_len),
            }));
            self.state = State::ClusterChild;
        } else {
            // Void or CRC-32 ahead of the timecode stays in the prefix.
            self.pending_cluster = Some(pending);
        }
        self.end_cluster_if_exhausted(out);
        Ok(true)
    }

    fn on_cluster_child(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let Some((element, id_width)) = read_element_id(self.pending())? else {
            return Ok(false);
        };
        if self.cluster_remaining.is_none() && is_segment_level(element) {
            // Sibling terminates an unknown-length cluster.
            self.flush_run(out);
            out.push(StreamEvent::ClusterEnd);
            self.state = State::SegmentChild;
            return Ok(true);
        }
        let Some(length) = read_length(&self.pending()[id_width..])? else {
            return Ok(false);
        };
        if length.unknown {
            return Err(ContainerError::UnboundedElement(element));
        }
        let header_len = id_width + length.width;
        self.consume_segment(header_len as u64 + length.value)?;
        self.consume_cluster(header_len as u64 + length.value)?;
        self.push_span(Run::Media, header_len, out)?;
        self.state = State::BlockPayload { remaining: length.value };
        Ok(true)
    }

    fn on_block_payload(&mut self, out: &mut Vec<StreamEvent>) -> Result<bool, ContainerError> {
        let State::BlockPayload { remaining } = self.state else {
            unreachable!("block payload outside a cluster");
        };
        let available = self.pending().len();
        let take = available.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if take > 0 {
            self.push_span(Run::Media, take, out)?;
        }
        let left = remaining - take as u64;
        if left == 0 {
            self.state = State::ClusterChild;
            self.end_cluster_if_exhausted(out);
            Ok(true)
        } else {
            self.state = State::BlockPayload { remaining: left };
            Ok(false)
        }
    }

    /// Closes a known-length cluster once its declared size is consumed.
    fn end_cluster_if_exhausted(&mut self, out: &mut Vec<StreamEvent>) {
        if self.cluster_remaining == Some(0) && matches!(self.state, State::ClusterChild) {
            self.cluster_remaining = None;
            self.flush_run(out);
            out.push(StreamEvent::ClusterEnd);
            self.state = State::SegmentChild;
        }
    }
}

//! Reassembly of chunked blobs on the observer side.
//!
//! One transfer is open at a time. Frames that do not fit the open transfer are
//! dropped and reported; the receiver stays in whatever state it was in, so an
//! origin may simply resend.

use tracing::trace;

use crate::network::messages::{BlobChunk, BlobHeader};
use crate::report_violation_to;
use crate::sessions::config::ReplicationConfig;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};

use std::sync::Arc;

/// What a blob holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlobKind {
    /// The cart image.
    CartImage = 0,
    /// The cart's persistent storage.
    SaveImage = 1,
    /// A full state snapshot to restore after loading.
    InitialState = 2,
}

impl BlobKind {
    /// Number of blob kinds.
    pub const COUNT: usize = 3;

    /// Every kind, in wire order.
    pub const ALL: [Self; Self::COUNT] = [Self::CartImage, Self::SaveImage, Self::InitialState];

    /// Wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for BlobKind {
    type Error = BlobRejection;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::CartImage),
            1 => Ok(Self::SaveImage),
            2 => Ok(Self::InitialState),
            kind => Err(BlobRejection::UnknownKind { kind }),
        }
    }
}

impl std::fmt::Display for BlobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CartImage => write!(f, "cart image"),
            Self::SaveImage => write!(f, "save image"),
            Self::InitialState => write!(f, "initial state"),
        }
    }
}

/// Why a blob frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRejection {
    /// The kind byte names no [`BlobKind`].
    UnknownKind {
        /// The raw kind.
        kind: u8,
    },
    /// Begin while another transfer is open.
    TransferInProgress {
        /// The open transfer.
        open: BlobKind,
    },
    /// Begin for a kind that was already received.
    AlreadyReceived {
        /// The completed kind.
        kind: BlobKind,
    },
    /// Begin declared more than the configured maximum.
    TooLarge {
        /// Declared length.
        total_length: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Chunk or End with no open transfer.
    NoTransfer,
    /// Chunk or End whose kind or length differs from the open transfer.
    HeaderMismatch {
        /// Kind and length of the open transfer.
        expected: (u8, u32),
        /// Kind and length on the frame.
        received: (u8, u32),
    },
    /// Chunk payload larger than the configured chunk size.
    ChunkTooLarge {
        /// Payload length.
        len: usize,
        /// Configured chunk size.
        max: usize,
    },
    /// Chunk reaching past the end of the blob.
    OutOfBounds {
        /// Chunk offset.
        offset: u32,
        /// Chunk length.
        len: usize,
        /// Blob length.
        total_length: u32,
    },
}

impl std::fmt::Display for BlobRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKind { kind } => write!(f, "unknown blob kind {kind}"),
            Self::TransferInProgress { open } => {
                write!(f, "a transfer of the {open} is already in progress")
            },
            Self::AlreadyReceived { kind } => write!(f, "the {kind} was already received"),
            Self::TooLarge { total_length, max } => {
                write!(f, "blob of {total_length} bytes exceeds the maximum of {max}")
            },
            Self::NoTransfer => write!(f, "no transfer in progress"),
            Self::HeaderMismatch { expected, received } => write!(
                f,
                "frame for kind {} length {} does not match open transfer of kind {} length {}",
                received.0, received.1, expected.0, expected.1
            ),
            Self::ChunkTooLarge { len, max } => {
                write!(f, "chunk of {len} bytes exceeds the chunk size of {max}")
            },
            Self::OutOfBounds {
                offset,
                len,
                total_length,
            } => write!(
                f,
                "chunk at {offset} of {len} bytes overruns a blob of {total_length} bytes"
            ),
        }
    }
}

impl std::error::Error for BlobRejection {}

/// What the receiver did with an accepted frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A transfer was opened.
    Started(BlobKind),
    /// Chunk bytes were copied in.
    Stored {
        /// Bytes copied.
        len: usize,
    },
    /// The transfer was closed and its blob is available.
    Completed(BlobKind),
}

struct Transfer {
    kind: BlobKind,
    total_length: u32,
    buffer: Vec<u8>,
}

/// `Idle → Receiving → Idle` per origin connection.
pub struct BlobReceiver {
    chunk_size: usize,
    max_blob_length: u32,
    transfer: Option<Transfer>,
    blobs: [Option<Vec<u8>>; BlobKind::COUNT],
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for BlobReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            chunk_size,
            max_blob_length,
            transfer,
            blobs,
            violation_observer,
        } = self;

        f.debug_struct("BlobReceiver")
            .field("chunk_size", chunk_size)
            .field("max_blob_length", max_blob_length)
            .field(
                "transfer",
                &transfer
                    .as_ref()
                    .map(|t| (t.kind, t.total_length, t.buffer.len())),
            )
            .field(
                "received",
                &blobs
                    .iter()
                    .map(|blob| blob.as_ref().map(Vec::len))
                    .collect::<Vec<_>>(),
            )
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl BlobReceiver {
    /// Creates an idle receiver with the chunk size and blob cap of `config`.
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_blob_length: config.max_blob_length,
            transfer: None,
            blobs: [None, None, None],
            violation_observer: None,
        }
    }

    /// Routes dropped-frame reports to `observer`.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.violation_observer = observer;
        self
    }

    /// Replaces the observer dropped frames are reported to.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// Kind of the open transfer, if any.
    #[must_use]
    pub fn in_progress(&self) -> Option<BlobKind> {
        self.transfer.as_ref().map(|t| t.kind)
    }

    /// A completed blob.
    #[must_use]
    pub fn blob(&self, kind: BlobKind) -> Option<&[u8]> {
        self.blobs.get(kind.index())?.as_deref()
    }

    /// The open transfer's buffer.
    #[must_use]
    pub fn partial(&self) -> Option<&[u8]> {
        self.transfer.as_ref().map(|t| t.buffer.as_slice())
    }

    /// Drops every buffer, open or completed.
    pub fn clear(&mut self) {
        self.transfer = None;
        self.blobs = [None, None, None];
    }

    /// Handles a Begin frame. Rejections are reported and leave the receiver unchanged.
    pub fn begin(&mut self, header: BlobHeader) -> Result<ReceiveOutcome, BlobRejection> {
        let result = self.try_begin(header);
        self.report(result)
    }

    /// Handles a Chunk frame. Rejections are reported and leave the receiver unchanged.
    pub fn chunk(&mut self, chunk: &BlobChunk) -> Result<ReceiveOutcome, BlobRejection> {
        let result = self.try_chunk(chunk);
        self.report(result)
    }

    /// Handles an End frame. Rejections are reported and leave the receiver unchanged.
    pub fn end(&mut self, header: BlobHeader) -> Result<ReceiveOutcome, BlobRejection> {
        let result = self.try_end(header);
        self.report(result)
    }

    fn report(
        &self,
        result: Result<ReceiveOutcome, BlobRejection>,
    ) -> Result<ReceiveOutcome, BlobRejection> {
        if let Err(rejection) = &result {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Replication,
                "blob frame dropped: {}",
                rejection
            );
        }
        result
    }

    fn try_begin(&mut self, header: BlobHeader) -> Result<ReceiveOutcome, BlobRejection> {
        if let Some(open) = &self.transfer {
            return Err(BlobRejection::TransferInProgress { open: open.kind });
        }
        let kind = BlobKind::try_from(header.kind)?;
        if header.total_length > self.max_blob_length {
            return Err(BlobRejection::TooLarge {
                total_length: header.total_length,
                max: self.max_blob_length,
            });
        }
        if self.blob(kind).is_some() {
            return Err(BlobRejection::AlreadyReceived { kind });
        }

        // An empty blob never allocates.
        let buffer = if header.total_length == 0 {
            Vec::new()
        } else {
            vec![0; header.total_length as usize]
        };
        trace!("receiving {} of {} bytes", kind, header.total_length);
        self.transfer = Some(Transfer {
            kind,
            total_length: header.total_length,
            buffer,
        });
        Ok(ReceiveOutcome::Started(kind))
    }

    fn check_header(&self, kind: u8, total_length: u32) -> Result<&Transfer, BlobRejection> {
        let transfer = self.transfer.as_ref().ok_or(BlobRejection::NoTransfer)?;
        if transfer.kind.as_u8() != kind || transfer.total_length != total_length {
            return Err(BlobRejection::HeaderMismatch {
                expected: (transfer.kind.as_u8(), transfer.total_length),
                received: (kind, total_length),
            });
        }
        Ok(transfer)
    }

    fn try_chunk(&mut self, chunk: &BlobChunk) -> Result<ReceiveOutcome, BlobRejection> {
        self.check_header(chunk.kind, chunk.total_length)?;
        let len = chunk.bytes.len();
        if len > self.chunk_size {
            return Err(BlobRejection::ChunkTooLarge {
                len,
                max: self.chunk_size,
            });
        }
        let out_of_bounds = BlobRejection::OutOfBounds {
            offset: chunk.offset,
            len,
            total_length: chunk.total_length,
        };
        let start = chunk.offset as usize;
        let end = start.checked_add(len).ok_or_else(|| out_of_bounds.clone())?;
        if (len > 0 && chunk.offset >= chunk.total_length) || end > chunk.total_length as usize {
            return Err(out_of_bounds);
        }

        let transfer = self.transfer.as_mut().ok_or(BlobRejection::NoTransfer)?;
        let target = transfer
            .buffer
            .get_mut(start..end)
            .ok_or(out_of_bounds)?;
        target.copy_from_slice(&chunk.bytes);
        Ok(ReceiveOutcome::Stored { len })
    }

    fn try_end(&mut self, header: BlobHeader) -> Result<ReceiveOutcome, BlobRejection> {
        self.check_header(header.kind, header.total_length)?;
        let transfer = self.transfer.take().ok_or(BlobRejection::NoTransfer)?;
        let kind = transfer.kind;
        if let Some(slot) = self.blobs.get_mut(kind.index()) {
            *slot = Some(transfer.buffer);
        }
        trace!("received {}", kind);
        Ok(ReceiveOutcome::Completed(kind))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingObserver;

    fn header(kind: BlobKind, total_length: u32) -> BlobHeader {
        BlobHeader {
            kind: kind.as_u8(),
            total_length,
        }
    }

    fn chunk(kind: BlobKind, total_length: u32, offset: u32, bytes: Vec<u8>) -> BlobChunk {
        BlobChunk {
            kind: kind.as_u8(),
            total_length,
            offset,
            bytes,
        }
    }

    fn receiver() -> BlobReceiver {
        BlobReceiver::new(&ReplicationConfig::default())
    }

    #[test]
    fn kinds_round_trip_through_u8() {
        for kind in BlobKind::ALL {
            assert_eq!(BlobKind::try_from(kind.as_u8()), Ok(kind));
        }
        assert_eq!(
            BlobKind::try_from(3),
            Err(BlobRejection::UnknownKind { kind: 3 })
        );
    }

    #[test]
    fn full_transfer_completes() {
        let mut rx = receiver();
        let kind = BlobKind::CartImage;
        assert_eq!(rx.begin(header(kind, 6)), Ok(ReceiveOutcome::Started(kind)));
        assert_eq!(rx.in_progress(), Some(kind));
        rx.chunk(&chunk(kind, 6, 0, vec![1, 2, 3])).unwrap();
        rx.chunk(&chunk(kind, 6, 3, vec![4, 5, 6])).unwrap();
        assert_eq!(rx.end(header(kind, 6)), Ok(ReceiveOutcome::Completed(kind)));
        assert_eq!(rx.blob(kind), Some(&[1, 2, 3, 4, 5, 6][..]));
        assert_eq!(rx.in_progress(), None);
    }

    #[test]
    fn empty_blob_needs_no_chunks() {
        let mut rx = receiver();
        rx.begin(header(BlobKind::SaveImage, 0)).unwrap();
        assert_eq!(rx.partial().map(<[u8]>::len), Some(0));
        rx.end(header(BlobKind::SaveImage, 0)).unwrap();
        assert_eq!(rx.blob(BlobKind::SaveImage), Some(&[][..]));
    }

    #[test]
    fn overrunning_chunk_leaves_buffer_untouched() {
        let observer = Arc::new(CollectingObserver::new());
        let mut rx = receiver()
            .with_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));
        let kind = BlobKind::CartImage;
        rx.begin(header(kind, 100)).unwrap();
        rx.chunk(&chunk(kind, 100, 0, vec![7; 10])).unwrap();
        let before = rx.partial().unwrap().to_vec();

        let result = rx.chunk(&chunk(kind, 100, 90, vec![9; 20]));
        assert_eq!(
            result,
            Err(BlobRejection::OutOfBounds {
                offset: 90,
                len: 20,
                total_length: 100
            })
        );
        assert_eq!(rx.partial().unwrap(), &before[..]);
        assert_eq!(rx.in_progress(), Some(kind));
        assert!(observer.has_violation(ViolationKind::Replication));
    }

    #[test]
    fn offset_at_end_is_rejected() {
        let mut rx = receiver();
        rx.begin(header(BlobKind::CartImage, 4)).unwrap();
        assert!(matches!(
            rx.chunk(&chunk(BlobKind::CartImage, 4, 4, vec![1])),
            Err(BlobRejection::OutOfBounds { .. })
        ));
    }

    #[test]
    fn second_begin_is_rejected_while_open() {
        let mut rx = receiver();
        rx.begin(header(BlobKind::CartImage, 8)).unwrap();
        assert_eq!(
            rx.begin(header(BlobKind::SaveImage, 8)),
            Err(BlobRejection::TransferInProgress {
                open: BlobKind::CartImage
            })
        );
    }

    #[test]
    fn completed_blob_is_not_overwritten() {
        let mut rx = receiver();
        rx.begin(header(BlobKind::SaveImage, 1)).unwrap();
        rx.chunk(&chunk(BlobKind::SaveImage, 1, 0, vec![42])).unwrap();
        rx.end(header(BlobKind::SaveImage, 1)).unwrap();

        assert_eq!(
            rx.begin(header(BlobKind::SaveImage, 1)),
            Err(BlobRejection::AlreadyReceived {
                kind: BlobKind::SaveImage
            })
        );
        assert_eq!(rx.blob(BlobKind::SaveImage), Some(&[42][..]));
    }

    #[test]
    fn mismatched_or_orphan_frames_are_dropped() {
        let mut rx = receiver();
        assert_eq!(
            rx.chunk(&chunk(BlobKind::CartImage, 4, 0, vec![1])),
            Err(BlobRejection::NoTransfer)
        );
        assert_eq!(
            rx.end(header(BlobKind::CartImage, 4)),
            Err(BlobRejection::NoTransfer)
        );

        rx.begin(header(BlobKind::CartImage, 4)).unwrap();
        assert!(matches!(
            rx.chunk(&chunk(BlobKind::SaveImage, 4, 0, vec![1])),
            Err(BlobRejection::HeaderMismatch { .. })
        ));
        assert!(matches!(
            rx.end(header(BlobKind::CartImage, 5)),
            Err(BlobRejection::HeaderMismatch { .. })
        ));
        assert_eq!(rx.in_progress(), Some(BlobKind::CartImage));
    }

    #[test]
    fn limits_from_config_are_enforced() {
        let config = ReplicationConfig {
            chunk_size: 4,
            max_blob_length: 16,
            ..ReplicationConfig::default()
        };
        let mut rx = BlobReceiver::new(&config);
        assert_eq!(
            rx.begin(header(BlobKind::CartImage, 17)),
            Err(BlobRejection::TooLarge {
                total_length: 17,
                max: 16
            })
        );
        rx.begin(header(BlobKind::CartImage, 16)).unwrap();
        assert_eq!(
            rx.chunk(&chunk(BlobKind::CartImage, 16, 0, vec![0; 5])),
            Err(BlobRejection::ChunkTooLarge { len: 5, max: 4 })
        );
    }

    #[test]
    fn clear_releases_everything() {
        let mut rx = receiver();
        rx.begin(header(BlobKind::InitialState, 2)).unwrap();
        rx.clear();
        assert_eq!(rx.in_progress(), None);
        rx.begin(header(BlobKind::InitialState, 2)).unwrap();
    }
}

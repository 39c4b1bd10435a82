//! Cursor recovery on open.
//!
//! The metadata store value is both a fallback snapshot and the manifest
//! naming the current and previous primary segment. Recovery reads it,
//! then the newest entry of the current segment (or the previous one if the
//! current is missing or corrupt), and keeps whichever valid snapshot has the
//! greater mark-delete position.

use std::sync::Arc;

use bytes::Bytes;
use tally_core::{Limits, SegmentId, Version, WriteSeq};
use tally_log::SegmentLog;
use tally_meta::{MetaError, MetadataStore, Versioned};
use tracing::{debug, info, warn};

use crate::cursor::CursorId;
use crate::error::{CursorError, CursorResult};
use crate::persist::ManifestState;
use crate::record::{CursorSnapshot, Envelope};

/// Backend a recovered snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// The newest entry of a primary segment.
    PrimaryLog,
    /// The metadata store value.
    MetadataStore,
}

/// How a cursor came to exist on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A valid snapshot was found.
    Recovered {
        /// Where it was found.
        source: RecoverySource,
    },
    /// Neither backend held a valid snapshot; the cursor starts empty.
    Created,
}

impl OpenOutcome {
    /// Returns true if persisted state was replayed.
    #[must_use]
    pub const fn is_recovered(self) -> bool {
        matches!(self, Self::Recovered { .. })
    }
}

/// Result of [`RecoveryLoader::open`].
#[derive(Debug)]
pub struct Recovery {
    /// Recovered or created.
    pub outcome: OpenOutcome,
    /// The winning snapshot, if any.
    pub snapshot: Option<CursorSnapshot>,
    /// Bytes read from both backends.
    pub bytes_read: u64,
    pub(crate) manifest: ManifestState,
}

impl Recovery {
    /// Returns the write sequence the next flush will use.
    #[must_use]
    pub const fn next_seq(&self) -> WriteSeq {
        self.manifest.next_seq
    }

    /// Returns the primary segment named by the manifest (0 if none).
    #[must_use]
    pub const fn manifest_segment(&self) -> SegmentId {
        self.manifest.segment
    }

    /// Returns the manifest version, if a manifest exists.
    #[must_use]
    pub const fn manifest_version(&self) -> Option<Version> {
        self.manifest.version
    }
}

#[derive(Debug)]
struct Candidate {
    source: RecoverySource,
    seq: WriteSeq,
    snapshot: CursorSnapshot,
}

impl Candidate {
    /// Greater mark-delete wins, then the higher sequence; a full tie keeps
    /// `self`.
    fn beats(&self, other: &Self) -> bool {
        (self.snapshot.mark_delete(), self.seq) >= (other.snapshot.mark_delete(), other.seq)
    }
}

/// Reconstructs a cursor's newest durable state from both backends.
#[derive(Debug, Clone)]
pub struct RecoveryLoader {
    log: Arc<dyn SegmentLog>,
    meta: Arc<dyn MetadataStore>,
    limits: Limits,
    retry_attempts: u32,
}

impl RecoveryLoader {
    /// Creates a loader. Metadata reads that lose their connection are
    /// retried `retry_attempts` times.
    #[must_use]
    pub fn new(
        log: Arc<dyn SegmentLog>,
        meta: Arc<dyn MetadataStore>,
        limits: Limits,
        retry_attempts: u32,
    ) -> Self {
        Self {
            log,
            meta,
            limits,
            retry_attempts,
        }
    }

    /// Loads the newest valid snapshot of `id`.
    ///
    /// Unreadable or corrupt records are skipped, never accepted. If neither
    /// backend yields a valid snapshot the outcome is [`OpenOutcome::Created`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the metadata store stays unreachable, since
    /// without it the current primary segment is unknown.
    pub async fn open(&self, id: &CursorId) -> CursorResult<Recovery> {
        let mut bytes_read = 0u64;
        let mut manifest = ManifestState::default();
        let mut max_seq = WriteSeq::new(0);

        let mut metadata = None;
        let mut primary = None;

        if let Some(stored) = self.read_manifest(id).await? {
            bytes_read += stored.data.len() as u64;
            manifest.version = Some(stored.version);

            match Envelope::decode(stored.data) {
                Ok(envelope) => {
                    manifest.segment = envelope.segment_id;
                    manifest.previous = envelope.previous_segment_id;
                    max_seq = max_seq.max(envelope.seq);

                    match envelope.snapshot(&self.limits) {
                        Ok(snapshot) => {
                            metadata = Some(Candidate {
                                source: RecoverySource::MetadataStore,
                                seq: envelope.seq,
                                snapshot,
                            });
                        }
                        Err(e) => {
                            warn!(cursor = %id, error = %e, "Ignoring corrupt metadata snapshot");
                        }
                    }
                }
                Err(e) => warn!(cursor = %id, error = %e, "Ignoring corrupt cursor manifest"),
            }

            for segment_id in [manifest.segment, manifest.previous] {
                if segment_id.get() == 0 {
                    continue;
                }
                match self.read_segment(segment_id, &mut bytes_read).await {
                    Ok((seq, snapshot)) => {
                        max_seq = max_seq.max(seq);
                        primary = Some(Candidate {
                            source: RecoverySource::PrimaryLog,
                            seq,
                            snapshot,
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(cursor = %id, %segment_id, error = %e, "Cursor segment unreadable");
                    }
                }
            }
        }

        manifest.next_seq = max_seq.next();

        let winner = match (primary, metadata) {
            (Some(p), Some(m)) => Some(if p.beats(&m) { p } else { m }),
            (p, m) => p.or(m),
        };

        let recovery = match winner {
            Some(candidate) => {
                info!(
                    cursor = %id,
                    source = ?candidate.source,
                    seq = %candidate.seq,
                    mark_delete = %candidate.snapshot.mark_delete(),
                    ranges = candidate.snapshot.ranges.ranges.len(),
                    "Cursor recovered"
                );
                Recovery {
                    outcome: OpenOutcome::Recovered {
                        source: candidate.source,
                    },
                    snapshot: Some(candidate.snapshot),
                    bytes_read,
                    manifest,
                }
            }
            None => {
                info!(cursor = %id, bytes_read, "No valid cursor snapshot, creating cursor");
                Recovery {
                    outcome: OpenOutcome::Created,
                    snapshot: None,
                    bytes_read,
                    manifest,
                }
            }
        };
        Ok(recovery)
    }

    async fn read_manifest(&self, id: &CursorId) -> CursorResult<Option<Versioned>> {
        let path = id.metadata_path();
        let mut retries = 0;
        loop {
            match self.meta.get(&path).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(MetaError::NotFound { .. }) => return Ok(None),
                Err(e) if e.is_retryable() && retries < self.retry_attempts => {
                    retries += 1;
                    debug!(cursor = %id, retries, error = %e, "Retrying cursor manifest read");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads and validates the newest entry of one primary segment.
    async fn read_segment(
        &self,
        segment_id: SegmentId,
        bytes_read: &mut u64,
    ) -> CursorResult<(WriteSeq, CursorSnapshot)> {
        let handle = self.log.open_segment(segment_id).await?;
        let read = self.log.read_last_entry(&handle).await;
        if let Err(e) = self.log.close_segment(handle).await {
            debug!(%segment_id, error = %e, "Failed to close read-only segment handle");
        }
        let data: Bytes = read?;
        *bytes_read += data.len() as u64;

        let envelope = Envelope::decode(data)?;
        if envelope.segment_id != segment_id {
            return Err(CursorError::InvalidRecord {
                reason: "entry belongs to another segment",
            });
        }
        let snapshot = envelope.snapshot(&self.limits)?;
        Ok((envelope.seq, snapshot))
    }
}

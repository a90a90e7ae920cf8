//! A store served over the sync protocol.
//!
//! The storage peer answers `pull` with what it has (dependencies first,
//! split at signature checkpoints), persists `push` and `data` content one
//! piece per unit of work, and acknowledges what it stored. It never
//! verifies signatures: a node only hands it content it already accepted.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use cojson_core::{
    pack_pieces, CoValueKnownState, NewContentPiece, RawCoId, SessionNewContent,
};
use cojson_sync::{
    decode_frame, encode_message, join_lines, limits, Dialect, Frame, KnownMessage, SyncError,
    SyncMessage, Transport,
};

use crate::error::{Result, StoreError};
use crate::traits::{append_session, dependencies, known_state, Store};

/// Serves a [`Store`] to one node.
pub struct StoragePeer<S> {
    store: Arc<S>,
}

impl<S> Clone for StoragePeer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> StoragePeer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Answer one incoming message. Replies use the dialect the message
    /// was written in.
    pub fn handle(&self, message: SyncMessage) -> Result<Vec<SyncMessage>> {
        let dialect = match message {
            SyncMessage::Load(_) | SyncMessage::Content(_) | SyncMessage::Done { .. } => {
                Dialect::Legacy
            }
            _ => Dialect::Native,
        };
        let Some(message) = dialect.incoming(message) else {
            return Ok(Vec::new());
        };
        trace!(id = %message.id(), action = message.action(), "storage handling message");

        let replies = match message {
            SyncMessage::Pull { known_state } => self.handle_pull(&known_state)?,
            SyncMessage::Push { content, .. }
            | SyncMessage::Data {
                content: Some(content),
                ..
            } => self.store_piece(&content)?,
            SyncMessage::Data { .. }
            | SyncMessage::Ack { .. }
            | SyncMessage::Known(_)
            | SyncMessage::Load(_)
            | SyncMessage::Content(_)
            | SyncMessage::Done { .. } => Vec::new(),
        };
        Ok(replies
            .into_iter()
            .flat_map(|reply| dialect.outgoing(reply))
            .collect())
    }

    fn handle_pull(&self, theirs: &CoValueKnownState) -> Result<Vec<SyncMessage>> {
        let id = theirs.id;
        let Some(ours) = known_state(self.store.as_ref(), &id)? else {
            let mut replies = vec![SyncMessage::Data {
                known_state: CoValueKnownState::empty(id),
                known: false,
                content: None,
            }];
            if theirs.header {
                replies.push(SyncMessage::Pull {
                    known_state: CoValueKnownState::empty(id),
                });
            }
            return Ok(replies);
        };

        let mut replies = Vec::new();
        for dependency in dependencies(self.store.as_ref(), &id)? {
            let Some(dep_known) = known_state(self.store.as_ref(), &dependency)? else {
                continue;
            };
            for piece in self.content_since(&dependency, None)? {
                replies.push(SyncMessage::Data {
                    known_state: dep_known.clone(),
                    known: true,
                    content: Some(piece),
                });
            }
        }

        let pieces = self.content_since(&id, Some(theirs))?;
        if pieces.is_empty() {
            replies.push(SyncMessage::Data {
                known_state: ours.clone(),
                known: true,
                content: None,
            });
        }
        for piece in pieces {
            replies.push(SyncMessage::Data {
                known_state: ours.clone(),
                known: true,
                content: Some(piece),
            });
        }

        if !ours.covers(theirs) {
            replies.push(SyncMessage::Pull { known_state: ours });
        }
        Ok(replies)
    }

    /// Stored content the holder of `theirs` lacks. Each session is cut at
    /// its checkpoints so every segment carries a signature that covers it.
    pub fn content_since(
        &self,
        id: &RawCoId,
        theirs: Option<&CoValueKnownState>,
    ) -> Result<Vec<NewContentPiece>> {
        let Some(co_value) = self.store.get_co_value(id)? else {
            return Ok(Vec::new());
        };

        let mut sessions = Vec::new();
        for session in self.store.get_co_value_sessions(co_value.row_id)? {
            let from = theirs.map(|t| t.count(&session.session_id)).unwrap_or(0);
            if from >= session.last_idx {
                continue;
            }
            let txs = self.store.get_new_transaction_in_session(session.row_id, from)?;
            if txs.len() != (session.last_idx - from) as usize {
                return Err(StoreError::InvalidData(format!(
                    "session {} of {id} has {} stored transactions after {from}, expected {}",
                    session.session_id,
                    txs.len(),
                    session.last_idx - from
                )));
            }

            let mut segments = Vec::new();
            let mut start = from;
            let checkpoints = self.store.get_signatures(session.row_id, from)?;
            for (idx, signature) in checkpoints {
                if idx + 1 >= session.last_idx {
                    break;
                }
                segments.push(SessionNewContent {
                    after: start,
                    new_transactions: txs[(start - from) as usize..=(idx - from) as usize].to_vec(),
                    last_signature: signature,
                });
                start = idx + 1;
            }
            segments.push(SessionNewContent {
                after: start,
                new_transactions: txs[(start - from) as usize..].to_vec(),
                last_signature: session.last_signature,
            });
            sessions.push((session.session_id, segments));
        }

        let send_header = !theirs.is_some_and(|t| t.header);
        let header = send_header.then(|| co_value.header.clone());
        if header.is_none() && sessions.is_empty() {
            return Ok(Vec::new());
        }
        Ok(pack_pieces(*id, header, co_value.header.priority(), sessions))
    }

    /// Persist one piece atomically. A piece that would leave a gap, or
    /// that lacks the header of an unknown CoValue, is refused with a
    /// correction carrying what the store actually has.
    fn store_piece(&self, piece: &NewContentPiece) -> Result<Vec<SyncMessage>> {
        let id = piece.id;
        let written = self.store.unit_of_work(|writer| {
            let row = match (writer.get_co_value(&id)?, &piece.header) {
                (Some(existing), _) => existing.row_id,
                (None, Some(header)) => writer.add_co_value(&id, header)?,
                (None, None) => return Err(correction_required(id)),
            };
            for (session_id, content) in &piece.new {
                let fits = append_session(
                    writer,
                    row,
                    session_id,
                    content.after,
                    &content.new_transactions,
                    content.last_signature,
                )?;
                if !fits {
                    return Err(correction_required(id));
                }
            }
            Ok(())
        });

        match written {
            Ok(()) => {
                let ours = known_state(self.store.as_ref(), &id)?
                    .unwrap_or_else(|| CoValueKnownState::empty(id));
                debug!(id = %id, transactions = piece.transaction_count(), "stored content");
                Ok(vec![SyncMessage::Ack { known_state: ours }])
            }
            Err(StoreError::Sync(SyncError::CorrectionRequired { .. })) => {
                let ours = known_state(self.store.as_ref(), &id)?
                    .unwrap_or_else(|| CoValueKnownState::empty(id));
                debug!(id = %id, "content does not fit stored sessions, sending correction");
                Ok(vec![SyncMessage::Known(KnownMessage::correction(ours))])
            }
            Err(e) => Err(e),
        }
    }
}

fn correction_required(id: RawCoId) -> StoreError {
    StoreError::Sync(SyncError::CorrectionRequired {
        peer: "storage".into(),
        id,
    })
}

impl<S: Store + 'static> StoragePeer<S> {
    /// Serve `transport` until the node hangs up. Store calls run on the
    /// blocking pool.
    pub async fn run<T: Transport + ?Sized>(&self, transport: &T) -> Result<()> {
        while let Some(frame) = transport.recv().await? {
            for frame in decode_frame(&frame) {
                let Frame::Message(message) = frame else {
                    continue;
                };
                let peer = self.clone();
                let replies = tokio::task::spawn_blocking(move || peer.handle(message))
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?;
                let replies = match replies {
                    Ok(replies) => replies,
                    Err(e) => {
                        warn!(error = %e, "storage could not handle message");
                        continue;
                    }
                };
                send_batched(transport, &replies).await?;
            }
        }
        debug!("storage peer disconnected");
        Ok(())
    }
}

async fn send_batched<T: Transport + ?Sized>(transport: &T, replies: &[SyncMessage]) -> Result<()> {
    let mut lines: Vec<Bytes> = Vec::new();
    let mut size = 0;
    for reply in replies {
        let line = encode_message(reply)?;
        if !lines.is_empty() && size + line.len() > limits::DEFAULT_MAX_BATCH_BYTES {
            transport.send(join_lines(&lines)).await?;
            lines.clear();
            size = 0;
        }
        size += line.len() + 1;
        lines.push(line);
    }
    if !lines.is_empty() {
        transport.send(join_lines(&lines)).await?;
    }
    Ok(())
}

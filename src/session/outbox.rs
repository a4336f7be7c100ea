//! Outbound frame queue and socket writer
//!
//! Every frame a session sends goes through one bounded channel drained by a
//! single writer task, so frames from concurrent pipelines never interleave
//! mid-frame. Frames queued by a pipeline carry that pipeline's
//! cancellation token; the writer discards them if the token was cancelled
//! while they waited, which drops stale audio after a barge-in.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Frame, FrameCodec, MessageType};
use crate::{Error, Result};

/// A queued frame and the pipeline that owns it, if any
#[derive(Debug)]
pub struct Outbound {
    frame: Frame,
    owner: Option<CancellationToken>,
}

impl Outbound {
    #[must_use]
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    #[must_use]
    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Owner was cancelled after this frame was queued
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.owner.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Sending half of a session's outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Create the queue; the receiver goes to [`run_writer`]
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a session-level frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the writer has stopped
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.enqueue(Outbound { frame, owner: None }).await
    }

    /// Queue an `ERROR` frame with a text payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the writer has stopped
    pub async fn send_error(&self, message: &str) -> Result<()> {
        self.send(Frame::text(MessageType::Error, message)).await
    }

    /// Bind this outbox to a pipeline's cancellation token
    #[must_use]
    pub fn scoped(&self, owner: CancellationToken) -> ScopedOutbox {
        ScopedOutbox {
            outbox: self.clone(),
            owner,
        }
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.tx
            .send(outbound)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Outbox whose frames are discarded once the owning pipeline is cancelled
#[derive(Debug, Clone)]
pub struct ScopedOutbox {
    outbox: Outbox,
    owner: CancellationToken,
}

impl ScopedOutbox {
    /// Queue a frame owned by this pipeline
    ///
    /// A cancelled owner sends nothing and succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the writer has stopped
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.owner.is_cancelled() {
            return Ok(());
        }
        self.outbox
            .enqueue(Outbound {
                frame,
                owner: Some(self.owner.clone()),
            })
            .await
    }
}

/// Drain the outbound queue into `writer` until every sender is gone
///
/// # Errors
///
/// Returns error if writing to the peer fails
pub async fn run_writer<W>(mut rx: mpsc::Receiver<Outbound>, writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec);
    let mut written = 0_u64;
    let mut discarded = 0_u64;

    while let Some(outbound) = rx.recv().await {
        if outbound.is_stale() {
            discarded += 1;
            tracing::trace!(
                kind = ?outbound.frame.message_type(),
                "discarding frame from cancelled pipeline"
            );
            continue;
        }
        sink.send(outbound.frame).await?;
        written += 1;
    }

    sink.close().await?;
    tracing::debug!(written, discarded, "writer finished");
    Ok(())
}

use std::sync::Arc;

use duet_proto::{ControlMessage, MediaState};
use tracing::{debug, warn};

use crate::peer::ControlStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The stream was not open; the value now sits in the pending slot.
    Queued,
    /// The peer already has this state.
    Unchanged,
}

/// Media-state sync over the auxiliary stream.
///
/// Holds at most one undelivered state. Whatever is queued while the
/// stream is down is replaced by newer values and goes out once, in the
/// flush scheduled after the stream opens.
#[derive(Default)]
pub struct ControlChannel {
    stream: Option<Arc<dyn ControlStream>>,
    pending: Option<MediaState>,
    last_sent: Option<MediaState>,
    flush_armed: bool,
    debounce_seq: u64,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, stream: Arc<dyn ControlStream>) {
        debug!(label = stream.label(), open = stream.is_open(), "control stream attached");
        self.stream = Some(stream);
        self.last_sent = None;
        self.flush_armed = false;
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| stream.is_open())
    }

    pub fn pending(&self) -> Option<MediaState> {
        self.pending
    }

    /// Records that the stream opened. True means the caller should
    /// schedule the post-open flush; later calls for the same stream are
    /// ignored.
    pub fn mark_opened(&mut self) -> bool {
        if self.stream.is_none() || self.flush_armed {
            return false;
        }
        self.flush_armed = true;
        true
    }

    /// Sends at most one state: the queued one if present, else `current`.
    /// Skipped when it matches what the peer last received.
    pub async fn flush(&mut self, current: MediaState) -> Delivery {
        let state = self.pending.take().unwrap_or(current);
        if self.last_sent == Some(state) && self.is_open() {
            debug!(?state, "peer already has media state, skipping flush");
            return Delivery::Unchanged;
        }
        self.publish(state).await
    }

    pub async fn publish(&mut self, state: MediaState) -> Delivery {
        let stream = match &self.stream {
            Some(stream) if stream.is_open() => stream.clone(),
            _ => {
                debug!(?state, "control stream not open, queueing media state");
                self.pending = Some(state);
                return Delivery::Queued;
            }
        };
        match stream.send_text(ControlMessage::from(state).encode()).await {
            Ok(()) => {
                debug!(?state, "sent media state");
                self.last_sent = Some(state);
                Delivery::Sent
            }
            Err(err) => {
                warn!(error = %err, "failed to send media state, queueing");
                self.pending = Some(state);
                Delivery::Queued
            }
        }
    }

    /// Starts a new debounce window and returns its token. Only the token
    /// of the newest window is honoured when its timer fires.
    pub fn arm_debounce(&mut self) -> u64 {
        self.debounce_seq += 1;
        self.debounce_seq
    }

    pub fn is_current_debounce(&self, seq: u64) -> bool {
        seq == self.debounce_seq
    }

    /// Best-effort notice to the peer. Returns whether it went out.
    pub async fn send_call_ended(&self) -> bool {
        match &self.stream {
            Some(stream) if stream.is_open() => {
                match stream.send_text(ControlMessage::CallEnded.encode()).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "failed to send callEnded");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Closes the stream and clears every slot.
    pub async fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
        self.pending = None;
        self.last_sent = None;
        self.flush_armed = false;
    }
}

/// Parses an inbound frame. Malformed frames are logged and dropped.
pub fn decode_incoming(text: &str) -> Option<ControlMessage> {
    match ControlMessage::decode(text) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, payload_len = text.len(), "dropping malformed control message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingStream {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlStream for RecordingStream {
        fn label(&self) -> &str {
            "mediaState"
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: String) -> Result<(), PeerError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn sent_states(stream: &RecordingStream) -> Vec<ControlMessage> {
        stream
            .sent
            .lock()
            .iter()
            .map(|text| ControlMessage::decode(text).unwrap())
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn queued_state_is_flushed_once_with_latest_value() {
        let stream = Arc::new(RecordingStream::default());
        let mut channel = ControlChannel::new();
        channel.attach(stream.clone());

        assert_eq!(
            channel.publish(MediaState::new(true, false)).await,
            Delivery::Queued
        );
        channel.publish(MediaState::new(true, true)).await;
        assert!(stream.sent.lock().is_empty());

        stream.open.store(true, Ordering::SeqCst);
        assert!(channel.mark_opened());
        assert!(!channel.mark_opened(), "second open must not schedule another flush");

        assert_eq!(channel.flush(MediaState::default()).await, Delivery::Sent);
        assert_eq!(
            sent_states(&stream),
            vec![ControlMessage::MediaState(MediaState::new(true, true))]
        );
        assert!(channel.pending().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_without_pending_sends_current_state() {
        let stream = Arc::new(RecordingStream::default());
        stream.open.store(true, Ordering::SeqCst);
        let mut channel = ControlChannel::new();
        channel.attach(stream.clone());

        channel.flush(MediaState::new(false, true)).await;
        assert_eq!(
            sent_states(&stream),
            vec![ControlMessage::MediaState(MediaState::new(false, true))]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_does_not_repeat_state_already_sent() {
        let stream = Arc::new(RecordingStream::default());
        stream.open.store(true, Ordering::SeqCst);
        let mut channel = ControlChannel::new();
        channel.attach(stream.clone());
        assert!(channel.mark_opened());

        // A toggle lands during the open delay and goes out first.
        let muted = MediaState::new(true, false);
        assert_eq!(channel.publish(muted).await, Delivery::Sent);
        assert_eq!(channel.flush(muted).await, Delivery::Unchanged);
        assert_eq!(sent_states(&stream), vec![ControlMessage::MediaState(muted)]);

        assert_eq!(channel.flush(MediaState::default()).await, Delivery::Sent);
        assert_eq!(sent_states(&stream).len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn call_ended_only_goes_out_on_open_stream() {
        let stream = Arc::new(RecordingStream::default());
        let mut channel = ControlChannel::new();
        assert!(!channel.send_call_ended().await);

        channel.attach(stream.clone());
        assert!(!channel.send_call_ended().await);

        stream.open.store(true, Ordering::SeqCst);
        assert!(channel.send_call_ended().await);
        assert_eq!(sent_states(&stream), vec![ControlMessage::CallEnded]);

        channel.shutdown().await;
        assert!(!stream.is_open());
        assert!(!channel.has_stream());
    }

    #[test_timeout::timeout]
    fn only_newest_debounce_window_counts() {
        let mut channel = ControlChannel::new();
        let first = channel.arm_debounce();
        let second = channel.arm_debounce();
        assert!(!channel.is_current_debounce(first));
        assert!(channel.is_current_debounce(second));
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_dropped() {
        assert!(decode_incoming("{\"type\":\"mystery\"}").is_none());
        assert_eq!(
            decode_incoming("{\"type\":\"callEnded\"}"),
            Some(ControlMessage::CallEnded)
        );
    }
}

//! Directional cipher states for the encrypted transport.
//!
//! Noise's regular transport mode uses an implicit nonce counter that requires
//! in-order delivery. The underlying transport can reorder and duplicate
//! packets, so we:
//! - Split the finished handshake into snow's stateless transport mode
//! - Send the 64-bit counter in clear next to each ciphertext
//! - Use the counter as the AEAD nonce and track received counters in a
//!   sliding window for replay protection
//!
//! Both halves share one snow transport object; each only ever touches its own
//! direction.

use std::sync::Arc;

use bytes::Bytes;
use snow::StatelessTransportState;

use tox_core::{NoiseFrame, AEAD_TAG_SIZE, MAX_PLAINTEXT_SIZE};

use crate::noise::NoiseError;
use crate::seq_window::SequenceWindow;

/// Outbound half of an established session.
pub struct SendCipher {
    transport: Arc<StatelessTransportState>,
    next_counter: u64,
}

impl SendCipher {
    pub(crate) fn new(transport: Arc<StatelessTransportState>) -> Self {
        Self {
            transport,
            next_counter: 0,
        }
    }

    /// Seal `plaintext` under the next counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<NoiseFrame, NoiseError> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(NoiseError::PayloadTooLarge(plaintext.len(), MAX_PLAINTEXT_SIZE));
        }
        // u64::MAX is reserved by Noise for rekeying.
        if self.next_counter == u64::MAX {
            return Err(NoiseError::CounterExhausted);
        }

        let counter = self.next_counter;
        let mut buf = vec![0u8; plaintext.len() + AEAD_TAG_SIZE];
        let len = self
            .transport
            .write_message(counter, plaintext, &mut buf)
            .map_err(|e| NoiseError::EncryptionFailed(e.to_string()))?;
        buf.truncate(len);

        self.next_counter += 1;
        Ok(NoiseFrame {
            counter,
            ciphertext: Bytes::from(buf),
        })
    }

    /// Counter the next frame will use.
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}

/// Inbound half of an established session.
pub struct RecvCipher {
    transport: Arc<StatelessTransportState>,
    window: SequenceWindow,
}

impl RecvCipher {
    pub(crate) fn new(transport: Arc<StatelessTransportState>) -> Self {
        Self {
            transport,
            window: SequenceWindow::new(),
        }
    }

    /// Open a frame.
    ///
    /// # Errors
    /// Returns `NoiseError::Replay` if the counter was already accepted or has
    /// fallen out of the window.
    pub fn decrypt(&mut self, frame: &NoiseFrame) -> Result<Vec<u8>, NoiseError> {
        // Check replay window BEFORE decryption (fail fast)
        if !self.window.check(frame.counter) {
            return Err(NoiseError::Replay(frame.counter));
        }
        if frame.ciphertext.len() < AEAD_TAG_SIZE {
            return Err(NoiseError::DecryptionFailed("ciphertext too short".into()));
        }

        let mut buf = vec![0u8; frame.ciphertext.len()];
        let len = self
            .transport
            .read_message(frame.counter, &frame.ciphertext, &mut buf)
            .map_err(|e| NoiseError::DecryptionFailed(e.to_string()))?;
        buf.truncate(len);

        // Only record the counter once the frame authenticated, so forged
        // frames cannot burn window slots.
        self.window.accept(frame.counter);
        Ok(buf)
    }

    /// Highest counter accepted so far.
    pub fn highest_counter(&self) -> Option<u64> {
        self.window.highest()
    }
}

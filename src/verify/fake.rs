//! Programmable verifiers for tests.
//!
//! `FakeVerifier` decides immediately with a fixed state; `DeferredFakeVerifier`
//! records PROCESSING from `verify` and flips to its final state on the next
//! `update_status`, modeling asynchronous checks without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::PendingCommit;

use super::state::VerifierState;
use super::status::SimpleStatus;
use super::{with_status, Verifier, VerifyError};

pub struct FakeVerifier {
    name: &'static str,
    state: VerifierState,
    error_message: Option<String>,
    postpone: Option<Arc<AtomicBool>>,
}

impl FakeVerifier {
    pub fn new(state: VerifierState) -> Self {
        FakeVerifier::named("fake", state)
    }

    pub fn named(name: &'static str, state: VerifierState) -> Self {
        FakeVerifier {
            name,
            state,
            error_message: None,
            postpone: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Shares a flag the test can flip to gate `postpone()`.
    pub fn with_postpone(mut self, flag: Arc<AtomicBool>) -> Self {
        self.postpone = Some(flag);
        self
    }

    fn status(&self) -> SimpleStatus {
        SimpleStatus {
            state: self.state,
            error_message: self.error_message.clone(),
        }
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        pending.verified.insert(self.name, Box::new(self.status()));
        Ok(())
    }

    async fn update_status(&self, _queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        Ok(())
    }

    async fn postpone(&self, _pending: &PendingCommit) -> bool {
        self.postpone
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

pub struct DeferredFakeVerifier {
    name: &'static str,
    final_state: VerifierState,
    error_message: Option<String>,
}

impl DeferredFakeVerifier {
    pub fn new(final_state: VerifierState) -> Self {
        DeferredFakeVerifier::named("fake", final_state)
    }

    pub fn named(name: &'static str, final_state: VerifierState) -> Self {
        DeferredFakeVerifier {
            name,
            final_state,
            error_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[async_trait]
impl Verifier for DeferredFakeVerifier {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        pending
            .verified
            .insert(self.name, Box::new(SimpleStatus::processing()));
        Ok(())
    }

    async fn update_status(&self, queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        let name = self.name;
        for pending in with_status(name, queue, || Box::new(SimpleStatus::processing()), true) {
            pending.verified.insert(
                name,
                Box::new(SimpleStatus {
                    state: self.final_state,
                    error_message: self.error_message.clone(),
                }),
            );
        }
        Ok(())
    }
}

//! The bundle of external collaborators the queue works against.

use std::sync::Arc;

use crate::checkout::Checkout;
use crate::notify::{StatusEvent, StatusSink};
use crate::review::CodeReview;
use crate::types::PendingCommit;

/// Holds the code review service, the checkout and the status sink for one
/// queue instance. The context references these resources; it does not
/// manage their lifecycle.
#[derive(Clone)]
pub struct Context {
    pub review: Arc<dyn CodeReview>,
    pub checkout: Arc<dyn Checkout>,
    pub status: Arc<dyn StatusSink>,
}

impl Context {
    pub fn new(
        review: Arc<dyn CodeReview>,
        checkout: Arc<dyn Checkout>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Context {
            review,
            checkout,
            status,
        }
    }

    /// Convenience for pushing one verification event.
    pub fn send_status(&self, pending: &PendingCommit, verification: &str, payload: serde_json::Value) {
        self.status
            .send(pending, StatusEvent::new(verification, payload));
    }
}

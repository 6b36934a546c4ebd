//! Call-recording collaborator mocks shared by manager and verifier tests.
//!
//! Each mock records its mutating calls as formatted strings; tests assert
//! the exact call sequence with `check_calls` (which also clears the log, so
//! a test ends by asserting the calls it expects and nothing more).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::checkout::{Checkout, CheckoutError};
use crate::notify::{StatusEvent, StatusSink};
use crate::review::{
    CodeReview, FilePatch, IssueProps, PatchSet, ReviewError, ReviewMessage,
};
use crate::types::{IssueId, PatchsetId, PendingCommit, Revision};

pub const SVN_PATCH: &str = "\
Index: chrome/file.cc
===================================================================
--- chrome/file.cc\t(revision 74690)
+++ chrome/file.cc\t(working copy)
@@ -80,10 +80,10 @@
 // Foo
 // Bar
 void foo() {
-   return bar;
+   return foo;
 }
";

/// The canned issue every test starts from.
pub fn default_issue() -> IssueProps {
    IssueProps {
        issue: IssueId(31337),
        description: "foo".to_string(),
        reviewers: vec!["rev@example.com".to_string()],
        owner_email: "author@example.com".to_string(),
        patchsets: vec![PatchsetId(1)],
        messages: vec![ReviewMessage {
            sender: "author@example.com".to_string(),
            approval: false,
            text: Some("hi!".to_string()),
        }],
        commit: true,
        base_url: "svn://fake/repo".to_string(),
        closed: false,
    }
}

fn check(calls: &Mutex<Vec<String>>, expected: &[&str]) {
    let mut calls = calls.lock().unwrap();
    let actual: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(actual, expected);
    calls.clear();
}

/// Review service mock: canned issues, recorded mutations.
pub struct MockReview {
    pub issues: Mutex<BTreeMap<IssueId, IssueProps>>,
    pub calls: Mutex<Vec<String>>,
    /// When set, `set_flag` fails with an HTTP error.
    pub fail_set_flag: AtomicBool,
}

impl MockReview {
    pub fn new() -> Self {
        let mut issues = BTreeMap::new();
        issues.insert(IssueId(31337), default_issue());
        MockReview {
            issues: Mutex::new(issues),
            calls: Mutex::new(Vec::new()),
            fail_set_flag: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        MockReview {
            issues: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_set_flag: AtomicBool::new(false),
        }
    }

    pub fn insert_issue(&self, props: IssueProps) {
        self.issues.lock().unwrap().insert(props.issue, props);
    }

    pub fn remove_issue(&self, issue: IssueId) {
        self.issues.lock().unwrap().remove(&issue);
    }

    pub fn update_issue(&self, issue: IssueId, f: impl FnOnce(&mut IssueProps)) {
        let mut issues = self.issues.lock().unwrap();
        f(issues.get_mut(&issue).expect("unknown issue"));
    }

    /// Asserts the recorded mutation calls and clears the log.
    pub fn check_calls(&self, expected: &[&str]) {
        check(&self.calls, expected);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockReview {
    fn default() -> Self {
        MockReview::new()
    }
}

#[async_trait]
impl CodeReview for MockReview {
    fn url(&self) -> &str {
        "http://nowhere"
    }

    fn email(&self) -> &str {
        "commit-bot@example.com"
    }

    async fn get_pending_issues(&self) -> Result<Vec<IssueId>, ReviewError> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|props| props.commit && !props.closed)
            .map(|props| props.issue)
            .collect())
    }

    async fn get_issue_properties(&self, issue: IssueId) -> Result<IssueProps, ReviewError> {
        self.issues
            .lock()
            .unwrap()
            .get(&issue)
            .cloned()
            .ok_or(ReviewError::Status {
                status: 404,
                context: format!("api/{}", issue),
            })
    }

    async fn get_patch(
        &self,
        _issue: IssueId,
        _patchset: PatchsetId,
    ) -> Result<PatchSet, ReviewError> {
        Ok(PatchSet::new(vec![FilePatch::diff("chrome/file.cc", SVN_PATCH)]))
    }

    async fn close_issue(&self, issue: IssueId) -> Result<(), ReviewError> {
        self.record(format!("close_issue({})", issue));
        if let Some(props) = self.issues.lock().unwrap().get_mut(&issue) {
            props.closed = true;
        }
        Ok(())
    }

    async fn update_description(
        &self,
        issue: IssueId,
        description: &str,
    ) -> Result<(), ReviewError> {
        self.record(format!("update_description({}, {})", issue, description));
        Ok(())
    }

    async fn add_comment(&self, issue: IssueId, message: &str) -> Result<(), ReviewError> {
        self.record(format!("add_comment({}, {})", issue, message));
        Ok(())
    }

    async fn set_flag(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
        flag: &str,
        value: &str,
    ) -> Result<bool, ReviewError> {
        if self.fail_set_flag.load(Ordering::SeqCst) {
            return Err(ReviewError::Status {
                status: 500,
                context: format!("{}/edit_flags", issue),
            });
        }
        self.record(format!("set_flag({}, {}, {}, {})", issue, patchset, flag, value));
        Ok(true)
    }
}

/// Checkout mock: records every operation, fabricates revisions the way the
/// original test double did (prepare → 124, commit → 125).
pub struct MockCheckout {
    pub calls: Mutex<Vec<String>>,
}

impl MockCheckout {
    pub fn new() -> Self {
        MockCheckout {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn check_calls(&self, expected: &[&str]) {
        check(&self.calls, expected);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockCheckout {
    fn default() -> Self {
        MockCheckout::new()
    }
}

#[async_trait]
impl Checkout for MockCheckout {
    fn project_path(&self) -> &std::path::Path {
        std::path::Path::new("/mock/checkout")
    }

    fn project_name(&self) -> &str {
        "checkout"
    }

    async fn prepare(&self, revision: Option<&Revision>) -> Result<Revision, CheckoutError> {
        match revision {
            None => {
                self.record("prepare(None)".to_string());
                Ok(Revision::new("124"))
            }
            Some(rev) => {
                self.record(format!("prepare({})", rev));
                Ok(rev.clone())
            }
        }
    }

    async fn apply_patch(&self, patchset: &PatchSet) -> Result<(), CheckoutError> {
        self.record(format!("apply_patch({})", patchset.filenames().join(", ")));
        Ok(())
    }

    async fn commit(&self, message: &str, author: &str) -> Result<Revision, CheckoutError> {
        self.record(format!("commit({}, {})", message, author));
        Ok(Revision::new("125"))
    }

    fn get_settings(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Status sink mock: records event verification names.
pub struct RecordingSink {
    pub events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Asserts the verification names of recorded events and clears them.
    pub fn check_names(&self, expected: &[&str]) {
        let mut events = self.events.lock().unwrap();
        let actual: Vec<&str> = events.iter().map(|e| e.verification.as_str()).collect();
        assert_eq!(actual, expected);
        events.clear();
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        RecordingSink::new()
    }
}

impl StatusSink for RecordingSink {
    fn url(&self) -> Option<&str> {
        Some("http://localhost")
    }

    fn send(&self, _pending: &PendingCommit, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

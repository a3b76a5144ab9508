pub const DEFAULT_PREFIX: &str = "kindle";

/// Deterministic key layout shared by every coordinator instance. Per-user
/// keys embed the user's identity so users never contend on the same keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn request_key(&self, digest: &str) -> String {
        format!("{}:request:{digest}", self.prefix)
    }

    pub fn active_request(&self, user: &str) -> String {
        format!("{}:user:{user}:active_request", self.prefix)
    }

    pub fn request_counter(&self, user: &str) -> String {
        format!("{}:user:{user}:request_counter", self.prefix)
    }

    pub fn active_request_count(&self, user: &str) -> String {
        format!("{}:user:{user}:active_request_count", self.prefix)
    }

    pub fn ticket(&self, user: &str, token: &str) -> String {
        format!("{}:user:{user}:ticket:{token}", self.prefix)
    }
}

/// Sub-keys of one fingerprint's execution record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordKeys {
    pub progress: String,
    pub status: String,
    pub result: String,
    pub waiters: String,
    pub cancelled: String,
    pub request_number: String,
    pub accumulated: String,
    pub streaming: String,
}

impl RecordKeys {
    pub fn for_request(request_key: &str) -> Self {
        Self {
            progress: format!("{request_key}:progress"),
            status: format!("{request_key}:status"),
            result: format!("{request_key}:result"),
            waiters: format!("{request_key}:waiters"),
            cancelled: format!("{request_key}:cancelled"),
            request_number: format!("{request_key}:request_number"),
            accumulated: format!("{request_key}:accumulated"),
            streaming: format!("{request_key}:streaming"),
        }
    }

    /// Everything the last waiter removes once the result has been handed out.
    pub fn execution_record(&self) -> Vec<String> {
        vec![
            self.progress.clone(),
            self.result.clone(),
            self.status.clone(),
            self.waiters.clone(),
            self.cancelled.clone(),
            self.request_number.clone(),
        ]
    }
}

pub fn cancelled_key(request_key: &str) -> String {
    format!("{request_key}:cancelled")
}

pub fn progress_key(request_key: &str) -> String {
    format!("{request_key}:progress")
}

use rustc_hash::FxHashSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusClass {
    Success,
    /// recovered by reconnecting and reissuing the same request
    Transient,
    /// the server had nothing to say; only meaningful for long polls
    Idle,
    Fatal,
}

/// Maps HTTP statuses to their effect on a session.
///
/// The default treats 500 as transient. That is a workaround for hosting environments that
///  occasionally answer 500 for a request the server never saw, not a property of the signaling
///  protocol, so servers with different habits may need a different set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusPolicy {
    pub transient: FxHashSet<u16>,
    pub idle: FxHashSet<u16>,
}

impl StatusPolicy {
    pub fn new() -> StatusPolicy {
        StatusPolicy {
            transient: [500].into_iter().collect(),
            idle: [204, 304].into_iter().collect(),
        }
    }

    pub fn classify(&self, status: u16) -> StatusClass {
        if status == 200 {
            StatusClass::Success
        }
        else if self.transient.contains(&status) {
            StatusClass::Transient
        }
        else if self.idle.contains(&status) {
            StatusClass::Idle
        }
        else {
            StatusClass::Fatal
        }
    }

    /// outcome of a control request, which has no notion of idle responses
    pub fn classify_control(&self, status: u16) -> StatusClass {
        match self.classify(status) {
            StatusClass::Idle => StatusClass::Fatal,
            other => other,
        }
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ok(200, StatusClass::Success, StatusClass::Success)]
    #[case::server_error(500, StatusClass::Transient, StatusClass::Transient)]
    #[case::no_content(204, StatusClass::Idle, StatusClass::Fatal)]
    #[case::not_modified(304, StatusClass::Idle, StatusClass::Fatal)]
    #[case::forbidden(403, StatusClass::Fatal, StatusClass::Fatal)]
    #[case::bad_gateway(502, StatusClass::Fatal, StatusClass::Fatal)]
    #[case::created(201, StatusClass::Fatal, StatusClass::Fatal)]
    fn test_default_policy(#[case] status: u16, #[case] expected: StatusClass, #[case] expected_control: StatusClass) {
        let policy = StatusPolicy::new();
        assert_eq!(policy.classify(status), expected);
        assert_eq!(policy.classify_control(status), expected_control);
    }

    #[test]
    fn test_custom_policy() {
        let mut policy = StatusPolicy::new();
        policy.transient.insert(502);
        policy.transient.insert(503);
        policy.transient.remove(&500);

        assert_eq!(policy.classify(502), StatusClass::Transient);
        assert_eq!(policy.classify(500), StatusClass::Fatal);
    }
}

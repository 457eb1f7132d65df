use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::anthropic::{GenerationError, StoryGenerator};
use crate::models::{ApiSpec, StoryRequest};

pub(crate) fn oauth_request() -> StoryRequest {
    StoryRequest {
        title: "Implement OAuth login".into(),
        business_rules: vec![
            "Google email is the unique user identifier".into(),
            "Session expires after 30 minutes".into(),
        ],
        apis: vec![ApiSpec {
            name: "Google OAuth 2.0 API".into(),
            endpoint: Some("https://oauth2.googleapis.com/token".into()),
            method: Some("post".into()),
            description: None,
        }],
        objective: "secure login".into(),
        complexity: Some(5),
        acceptance_criteria: vec![
            "Given user clicks Google login, when authenticated, then redirected to dashboard".into(),
        ],
    }
}

/// A well-formed model answer for [`oauth_request`].
pub(crate) const OAUTH_STORY: &str = "\
## Implement OAuth login

### Context

The system currently uses basic username and password authentication.
A social login option is required.

### Objective

Provide secure login through the Google OAuth 2.0 API.

### Business Rules

- Google email is the unique user identifier
- Session expires after 30 minutes

### APIs and Services

- Google OAuth 2.0 API: user authentication and authorisation

### Technical Objectives

- Authenticate users with a Google account
- Issue a session after a successful token exchange

### Acceptance Criteria

AC1 - Start OAuth flow
Given user clicks Google login
When authenticated
Then redirected to dashboard

AC2 - Process authorisation
Given the user grants access
When Google redirects back
Then the system exchanges the code for tokens

AC3 - Handle denial
Given the user denies permission
When they return to the application
Then an error message is shown

### Suggested Test Scenarios

1. Success scenario: user completes the OAuth flow and reaches the dashboard
2. Error scenario: user denies permission and sees an error message
3. Edge case scenario: token expires during the session and the user is asked to log in again

### Complexity

Points: 5
";

/// In-process [`StoryGenerator`] that replays canned results and counts calls.
pub(crate) struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub(crate) fn new(script: Vec<Result<String, GenerationError>>) -> Self {
        Self { script: Mutex::new(script.into()), calls: AtomicUsize::new(0), delay: None }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoryGenerator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Service { status: 500, message: "script exhausted".into() }))
    }
}

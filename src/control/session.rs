use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stem_rs::controller::Controller;
use stem_rs::events::ParsedEvent;

use super::event::EventKind;
use super::ControlError;

/// One authenticated connection to the control port.
///
/// Commands and the notification feed share the connection; the caller must
/// hold the manager's session lock for every call.
pub struct Session {
    controller: Controller,
    created_at: Instant,
    subscribed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("subscribed", &self.subscribed)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Session {
    /// Connect and authenticate with the shared secret. An empty password
    /// requests null authentication.
    pub async fn open(
        address: SocketAddr,
        password: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let mut controller = within(connect_timeout, Controller::from_port(address)).await?;

        let password = (!password.is_empty()).then_some(password);
        within(request_timeout, controller.authenticate(password)).await?;

        Ok(Self {
            controller,
            created_at: Instant::now(),
            subscribed: false,
        })
    }

    /// `GETINFO <key>`, returning its value.
    pub async fn get_info(&mut self, key: &str, timeout: Duration) -> Result<String, ControlError> {
        within(timeout, self.controller.get_info(key)).await
    }

    /// Replace the notification subscription with `kinds`.
    pub async fn set_events(
        &mut self,
        kinds: &[EventKind],
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let types: Vec<_> = kinds.iter().map(|k| k.event_type()).collect();
        within(timeout, self.controller.set_events(&types)).await?;
        self.subscribed = !kinds.is_empty();
        Ok(())
    }

    /// Wait for the next notification.
    pub async fn recv_event(&mut self) -> Result<ParsedEvent, ControlError> {
        Ok(self.controller.recv_event().await?)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }
}

async fn within<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T, stem_rs::Error>>,
) -> Result<T, ControlError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ControlError::Timeout(timeout)),
    }
}

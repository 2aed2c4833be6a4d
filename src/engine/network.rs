//! Packet data network: attach, detach and status.

// ============================================================================
// Imports
// ============================================================================

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::pipeline::{Message, Operation};

use super::core::Engine;
use super::status::RegStatus;

// ============================================================================
// Engine - Network API
// ============================================================================

impl Engine {
    /// Brings up the packet data context and obtains an IP address.
    ///
    /// Shutting down the modem IP stack closes every open connection.
    ///
    /// # Errors
    ///
    /// Fails with the error of the first wire step that failed. The PDP
    /// deactivate step is tolerated when `ignore_pdp_deactivate_result` is
    /// set.
    pub async fn network_attach(
        &self,
        apn: impl Into<String>,
        user: impl Into<String>,
        pass: impl Into<String>,
        blocking: bool,
    ) -> Result<()> {
        let op = Operation::NetworkAttach {
            apn: apn.into(),
            user: user.into(),
            pass: pass.into(),
        };
        self.submit(Message::with_defaults(op, self.options()), blocking)
            .await
            .map(|_| ())
    }

    /// Tears down the packet data context.
    pub async fn network_detach(&self, blocking: bool) -> Result<()> {
        let msg = Message::with_defaults(Operation::NetworkDetach, self.options());
        self.submit(msg, blocking).await.map(|_| ())
    }

    /// Returns `true` while the packet data context is up.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.with_state(|st, _| st.network.attached)
    }

    /// Returns the local IP address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoIp`] if the network is not attached.
    pub fn local_ip(&self) -> Result<Ipv4Addr> {
        self.with_state(|st, _| match (st.network.attached, st.network.ip) {
            (true, Some(ip)) => Ok(ip),
            _ => Err(Error::NoIp),
        })
    }

    /// Returns the cached network registration status.
    #[must_use]
    pub fn reg_status(&self) -> RegStatus {
        self.with_state(|st, _| st.network.reg)
    }

    /// Returns the last reported RSSI in dBm, 0 if unknown.
    #[must_use]
    pub fn rssi(&self) -> i16 {
        self.with_state(|st, _| st.network.rssi)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::EngineOptions;
    use crate::testing::{attach, record_events, test_engine};

    #[tokio::test]
    async fn test_attach_obtains_ip() {
        let (engine, modem) = test_engine(EngineOptions::new());
        let events = record_events(&engine);

        assert!(matches!(engine.local_ip(), Err(Error::NoIp)));
        attach(&engine, &modem).await;

        assert!(engine.is_attached());
        assert_eq!(engine.local_ip().expect("ip"), Ipv4Addr::new(10, 64, 1, 7));
        assert_eq!(*events.lock(), vec!["network_attached"]);
    }

    #[tokio::test]
    async fn test_attach_tolerates_pdp_deactivate_error() {
        let (engine, modem) = test_engine(EngineOptions::new());

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.network_attach("internet", "user", "secret", true).await }
        });
        modem.expect("AT+CGACT=0\r\n").await;
        engine.feed(b"ERROR\r\n").expect("feed");
        modem.expect("AT+CGATT=1\r\n").await;
        engine.feed(b"ERROR\r\n").expect("feed");

        let err = task.await.expect("join").expect_err("attach fails");
        assert!(matches!(err, Error::Failed));
        assert!(!engine.is_attached());
        assert!(modem.is_idle());
    }

    #[tokio::test]
    async fn test_detach_clears_state() {
        let (engine, modem) = test_engine(EngineOptions::new());
        attach(&engine, &modem).await;
        let events = record_events(&engine);

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.network_detach(true).await }
        });
        modem.expect("AT+CGATT=0\r\n").await;
        engine.feed(b"ERROR\r\n").expect("feed");
        modem.expect("AT+CGACT=0\r\n").await;
        engine.feed(b"OK\r\n").expect("feed");

        task.await.expect("join").expect("detach");
        assert!(!engine.is_attached());
        assert_eq!(*events.lock(), vec!["network_detached"]);
    }

    #[tokio::test]
    async fn test_registration_updates() {
        let (engine, _modem) = test_engine(EngineOptions::new());
        let events = record_events(&engine);

        engine.feed(b"\r\n+CREG: 1\r\n").expect("feed");
        engine.feed(b"\r\n+CREG: 1\r\n").expect("feed");
        engine.feed(b"\r\n+CREG: 5\r\n").expect("feed");

        assert_eq!(engine.reg_status(), RegStatus::Roaming);
        assert!(engine.reg_status().is_registered());
        assert_eq!(*events.lock(), vec!["network_reg_changed", "network_reg_changed"]);
    }
}

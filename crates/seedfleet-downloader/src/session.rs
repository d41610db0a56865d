use crate::{ClientConfig, DownloaderClient, DownloaderError};

/// Scoped adapter session: connect on open, best-effort disconnect on close.
///
/// The session owns its client exclusively; concurrent use of one session is
/// forbidden by construction (no `Clone`). Services open a fresh session per
/// downloader per tick.
pub struct Session {
    client: Box<dyn DownloaderClient>,
}

impl Session {
    /// Open a session for the given connection parameters.
    ///
    /// # Errors
    ///
    /// Returns the connect failure; the half-open client is dropped.
    pub async fn open(config: &ClientConfig) -> Result<Self, DownloaderError> {
        let client = crate::create_client(config);
        match client.connect().await {
            Ok(()) => Ok(Self { client }),
            Err(err) => {
                client.disconnect().await;
                Err(err)
            }
        }
    }

    /// Borrow the connected client.
    #[must_use]
    pub fn client(&self) -> &dyn DownloaderClient {
        self.client.as_ref()
    }

    /// Close the session. Logout failures are swallowed.
    pub async fn close(self) {
        self.client.disconnect().await;
    }
}

//! # Connection Supervisor
//!
//! Owns the single broker link shared by every publisher and consumer loop.
//!
//! ```text
//! [DISCONNECTED] ──connect ok──→ [CONNECTED] ←──────────────┐
//!                                     │                      │
//!                          link found dead on use            │
//!                                     ↓                      │
//!                              [RECONNECTING] ──connect ok───┘
//!                                     │
//!                               connect failed
//!                                     ↓
//!                                 [FAILED] ──next use──→ [RECONNECTING]
//! ```
//!
//! Every publish and every reconnect runs under one async gate, so channel
//! writes never interleave and at most one reconnect is in flight. Callers
//! that queue behind a reconnect observe its outcome. Each use makes at most
//! one reconnect attempt; there is no background retry.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::BrokerSettings;
use crate::error::{BrokerError, ConnectivityError, PublishError};
use crate::ports::{BrokerChannel, BrokerConnector, Publication};

/// Link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link, either before the first connect or after `close`.
    #[default]
    Disconnected,
    Connected,
    /// A reconnect is in flight.
    Reconnecting,
    /// The last reconnect failed. The next use tries again.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Exclusive use of a live channel. Holding it blocks every other publish
/// and reconnect.
pub struct LinkGuard<'a> {
    _gate: MutexGuard<'a, ()>,
    channel: Arc<dyn BrokerChannel>,
}

impl LinkGuard<'_> {
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

/// Supervises the broker link. Shared by `Arc`.
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    settings: BrokerSettings,
    gate: Mutex<()>,
    current: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<LinkState>,
    reconnects: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionSupervisor {
    /// Open the link. Failure here is fatal to startup.
    ///
    /// # Errors
    ///
    /// `ConnectivityError` if the broker is unreachable or refuses the
    /// credentials.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        settings: BrokerSettings,
    ) -> Result<Arc<Self>, ConnectivityError> {
        let channel = match connector.connect(&settings).await {
            Ok(channel) => channel,
            Err(cause) => {
                error!(
                    address = %settings.address,
                    username = %settings.username,
                    error = %cause,
                    "Cannot connect to the messaging system"
                );
                return Err(ConnectivityError::new(&settings.address, cause));
            }
        };

        info!(address = %settings.address, "Connected to the messaging system");
        let (state, _) = watch::channel(LinkState::Connected);
        Ok(Arc::new(Self {
            connector,
            settings,
            gate: Mutex::new(()),
            current: RwLock::new(Some(channel)),
            state,
            reconnects: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Take the gate and make sure the link is live, reconnecting once if
    /// needed.
    ///
    /// # Errors
    ///
    /// `ConnectivityError` if the reconnect failed or the supervisor is
    /// closed.
    pub async fn acquire(&self) -> Result<LinkGuard<'_>, ConnectivityError> {
        let gate = self.gate.lock().await;
        let channel = self.live_channel().await?;
        Ok(LinkGuard {
            _gate: gate,
            channel,
        })
    }

    /// Live channel, reconnecting once if needed. Releases the gate before
    /// returning.
    ///
    /// # Errors
    ///
    /// As [`Self::acquire`].
    pub async fn ensure_live(&self) -> Result<Arc<dyn BrokerChannel>, ConnectivityError> {
        let link = self.acquire().await?;
        Ok(Arc::clone(link.channel()))
    }

    /// Publish under the gate with `deadline` around the broker round trip.
    ///
    /// # Errors
    ///
    /// `PublishError::Connectivity`, `PublishError::Timeout` or
    /// `PublishError::Broker`.
    pub async fn publish(
        &self,
        publication: Publication,
        deadline: Duration,
    ) -> Result<(), PublishError> {
        let exchange = publication.exchange.clone();
        let link = self.acquire().await?;

        match tokio::time::timeout(deadline, link.channel().publish(publication)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(cause)) => Err(PublishError::Broker { exchange, cause }),
            Err(_) => Err(PublishError::Timeout {
                exchange,
                after: deadline,
            }),
        }
    }

    /// Current channel without liveness check or reconnect.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.current.read().clone()
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Successful reconnects since startup.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Close the link. Later uses fail instead of reconnecting.
    pub async fn close(&self) {
        let _gate = self.gate.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let channel = self.current.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error while closing the broker link");
            }
        }
        self.transition(LinkState::Disconnected);
        info!(address = %self.settings.address, "Messaging link closed");
    }

    /// Requires the gate.
    async fn live_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectivityError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectivityError::new(
                &self.settings.address,
                BrokerError::ChannelClosed,
            ));
        }

        if let Some(channel) = self.current.read().as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
        }

        warn!(address = %self.settings.address, "Broker link lost, reconnecting");
        self.transition(LinkState::Reconnecting);

        // A channel-level error leaves the connection underneath open.
        let stale = self.current.write().take();
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Error while closing the stale broker link");
            }
        }

        match self.connector.connect(&self.settings).await {
            Ok(channel) => {
                *self.current.write() = Some(Arc::clone(&channel));
                self.reconnects.fetch_add(1, Ordering::SeqCst);
                self.transition(LinkState::Connected);
                info!(address = %self.settings.address, "Reconnected to the messaging system");
                Ok(channel)
            }
            Err(cause) => {
                self.transition(LinkState::Failed);
                error!(
                    address = %self.settings.address,
                    error = %cause,
                    "Cannot reconnect to the messaging system"
                );
                Err(ConnectivityError::new(&self.settings.address, cause))
            }
        }
    }

    fn transition(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Link state changed");
        }
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("reconnects", &self.reconnect_count())
            .finish_non_exhaustive()
    }
}

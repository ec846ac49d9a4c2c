//! Per-tick composition of the modem, the network state machine and the
//! persistent log.

use crate::board::{Clock, PowerKey, Watchdog};
use crate::fix::Fix;
use crate::modem::network::{GnssOutcome, NetworkManager, NetworkState};
use crate::modem::{Modem, ModemVariant};
use crate::serial::SerialLink;
use crate::storage::{AppendOutcome, BlockDevice, PersistentLog, ResendOutcome};
use crate::telemetry::{NetFailCounter, ServerEndpoint, TelemetryLink};
use tracing::{debug, info, warn};

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub network: NetworkState,
    pub append: Option<AppendOutcome>,
    pub resend: Option<ResendOutcome>,
}

pub struct Tracker<S, C, W, P, B> {
    modem: Modem<S, C, W, P>,
    network: NetworkManager,
    log: PersistentLog<B, W>,
    endpoint: ServerEndpoint,
    failures: NetFailCounter,
    manage_gnss: bool,
    gnss_on: bool,
}

impl<S, C, W, P, B> Tracker<S, C, W, P, B>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
    B: BlockDevice,
{
    pub fn new(
        modem: Modem<S, C, W, P>,
        network: NetworkManager,
        log: PersistentLog<B, W>,
        endpoint: ServerEndpoint,
        failures: NetFailCounter,
    ) -> Self {
        Self {
            modem,
            network,
            log,
            endpoint,
            failures,
            manage_gnss: true,
            gnss_on: false,
        }
    }

    /// Power the GNSS engine up once online
    pub fn with_gnss(mut self, manage: bool) -> Self {
        self.manage_gnss = manage;
        self
    }

    /// Power the modem on and identify it
    pub fn start(&mut self) -> ModemVariant {
        let variant = self.modem.power_on();
        info!("Tracker started with {}", variant);
        variant
    }

    pub fn log(&self) -> &PersistentLog<B, W> {
        &self.log
    }

    pub fn modem(&self) -> &Modem<S, C, W, P> {
        &self.modem
    }

    /// Sleep between ticks, still feeding the watchdog
    pub fn idle(&mut self, ms: u64) {
        self.modem.pause(ms);
    }

    /// Power the GNSS engine down before the loop exits
    pub fn shutdown(&mut self) {
        if self.gnss_on {
            if !self.network.disable_gnss(&mut self.modem) {
                warn!("GNSS power-down not confirmed");
            }
            self.gnss_on = false;
        }
        info!("Tracker stopped (network {:?})", self.network.state());
    }

    /// One pass of the cooperative loop: service the network, store the
    /// fix if any, and retry the oldest pending report while online
    pub fn tick(&mut self, fix: Option<&Fix>) -> TickReport {
        self.network.service(&mut self.modem);

        if self.manage_gnss && !self.gnss_on {
            match self.network.enable_gnss(&mut self.modem) {
                GnssOutcome::Enabled => self.gnss_on = true,
                GnssOutcome::NotOnline => {}
                GnssOutcome::Escalated => warn!("GNSS bring-up forced a modem reset"),
            }
        }

        let append = fix.map(|f| self.log.append(f));

        let resend = if self.network.state() == NetworkState::Online {
            let mut link = TelemetryLink::new(&mut self.modem, &self.endpoint);
            let outcome = self.log.resend_oldest_pending(&mut link, &mut self.failures);
            Some(outcome)
        } else {
            None
        };

        match resend {
            Some(ResendOutcome::Failed { sector, consecutive }) => {
                debug!("Sector {} not delivered ({} in a row)", sector, consecutive);
                let now = self.modem.now_ms();
                self.network.mark_offline(now);
            }
            Some(ResendOutcome::Escalated { .. }) => {
                self.network.restart();
                self.gnss_on = false;
            }
            _ => {}
        }

        TickReport {
            network: self.network.state(),
            append,
            resend,
        }
    }
}

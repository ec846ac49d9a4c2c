//! # Network Bring-up
//!
//! Ordered pipeline taking the modem from power-on to an active data
//! context, and the Booting / Offline / Online state machine that owns
//! reconnect scheduling.
//!
//! ```text
//!   Booting ──ok──▶ Online ──mark_offline()──▶ Offline
//!      │                                        │  ▲
//!      └──fail──▶ Offline ◀──fail (cooldown)────┘  │
//!                    └────────ok (cooldown)────────┘ → Online
//! ```

use super::dialect::RadioProfile;
use super::Modem;
use crate::board::{Clock, PowerKey, Watchdog};
use crate::serial::SerialLink;
use tracing::{debug, info, warn};

/// Handshake probes before bring-up is abandoned
const HANDSHAKE_TRIES: u8 = 15;

const SIM_POLL_TRIES: u8 = 10;
const SIM_POLL_DELAY_MS: u64 = 1500;

const REGISTRATION_TRIES: u8 = 20;
const REGISTRATION_DELAY_MS: u64 = 2000;

/// Registration status codes accepted as attached
const REGISTERED_HOME: u8 = 1;
const REGISTERED_ROAMING: u8 = 5;

/// Coarse connectivity state exposed to the rest of the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkState {
    #[default]
    Booting,
    Offline,
    Online,
}

/// Pipeline stage that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    Handshake,
    RadioConfig,
    SimReady,
    Registration,
    DataContext,
}

/// Extract the `<stat>` field of a `+CREG:` / `+CEREG:` query reply.
///
/// Returns `None` when the prefix or the field is missing.
pub fn registration_status(reply: &str, prefix: &str) -> Option<u8> {
    let start = reply.find(prefix)? + prefix.len();
    let line = reply[start..].lines().next()?;
    line.split(',').nth(1)?.trim().parse().ok()
}

fn is_attached(status: Option<u8>) -> bool {
    matches!(status, Some(REGISTERED_HOME) | Some(REGISTERED_ROAMING))
}

impl<S, C, W, P> Modem<S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    /// Echo off, verbose errors, unsolicited reports and time sync off,
    /// band and technology profile, then restart the radio.
    pub fn configure_radio(&mut self, profile: &RadioProfile) -> bool {
        info!("Configuring radio ({})", self.variant);
        self.send_command("ATE0", "OK", 1000, 2);
        self.send_command("AT+CMEE=2", "OK", 1000, 2);

        let dialect = self.dialect();
        self.run_steps(dialect.radio_setup, profile);

        self.send_command("AT+CGEREP=0,0", "OK", 1000, 2);
        self.send_command("AT+CTZU=0", "OK", 1000, 2);
        self.send_command("AT+CREG=0", "OK", 1000, 2);
        self.send_command("AT+CEREG=0", "OK", 1000, 2);

        self.close_data_stack(profile);

        match profile.expand("AT+CGDCONT=1,\"IP\",\"{apn}\"", self.variant) {
            Some(cmd) if self.send_command(&cmd, "OK", 500, 3) => {}
            _ => warn!("Early APN configuration failed, continuing"),
        }

        if !self.run_steps(dialect.technology, profile) {
            return false;
        }

        debug!("Turning radio on (CFUN=1,1)");
        self.write_line("AT+CFUN=1,1");
        self.pause(500);
        true
    }

    /// Poll `AT+CPIN?` until the SIM reports ready
    pub fn wait_for_sim(&mut self) -> bool {
        for attempt in 1..=SIM_POLL_TRIES {
            self.write_line("AT+CPIN?");
            self.read_response(1000);
            if self.buffer.contains("+CPIN: READY") {
                info!("SIM ready");
                return true;
            }
            debug!("SIM not ready (try {})", attempt);
            self.pause(SIM_POLL_DELAY_MS);
        }
        warn!("SIM not ready after {} tries", SIM_POLL_TRIES);
        false
    }

    /// Poll signal, operator and both registration registers until either
    /// register reports home or roaming
    pub fn wait_for_registration(&mut self) -> bool {
        for attempt in 1..=REGISTRATION_TRIES {
            self.watchdog.feed();
            debug!("Registration check {}", attempt);
            self.send_command("AT+CSQ", "+CSQ", 500, 1);
            self.send_command("AT+COPS?", "+COPS", 3000, 1);

            self.send_command("AT+CREG?", "+CREG:", 500, 1);
            let creg = registration_status(self.buffer.text(), "+CREG:");
            self.send_command("AT+CEREG?", "+CEREG:", 500, 1);
            let cereg = registration_status(self.buffer.text(), "+CEREG:");

            if is_attached(creg) || is_attached(cereg) {
                info!("Registered (CREG {:?}, CEREG {:?})", creg, cereg);
                return true;
            }
            self.pause(REGISTRATION_DELAY_MS);
        }
        warn!("Network registration failed");
        false
    }

    /// Full bring-up pipeline; stops at the first failing stage
    pub fn bring_up(&mut self, profile: &RadioProfile) -> Result<(), BringUpStep> {
        if !self.handshake(HANDSHAKE_TRIES) {
            return Err(BringUpStep::Handshake);
        }
        if !self.configure_radio(profile) {
            return Err(BringUpStep::RadioConfig);
        }
        if !self.wait_for_sim() {
            return Err(BringUpStep::SimReady);
        }
        if !self.wait_for_registration() {
            return Err(BringUpStep::Registration);
        }
        if !self.open_data_stack(profile) {
            return Err(BringUpStep::DataContext);
        }
        Ok(())
    }
}

/// Result of a GNSS power-up request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnssOutcome {
    Enabled,
    /// Network not online; nothing attempted
    NotOnline,
    /// Both attempts failed and the modem was power-cycled
    Escalated,
}

/// Booting / Offline / Online state machine
#[derive(Debug)]
pub struct NetworkManager {
    state: NetworkState,
    last_attempt_ms: u64,
    reconnect_interval_ms: u64,
    profile: RadioProfile,
}

impl NetworkManager {
    pub fn new(profile: RadioProfile, reconnect_interval_ms: u64) -> Self {
        Self {
            state: NetworkState::Booting,
            last_attempt_ms: 0,
            reconnect_interval_ms,
            profile,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn profile(&self) -> &RadioProfile {
        &self.profile
    }

    /// Advance the state machine by one tick
    pub fn service<S, C, W, P>(&mut self, modem: &mut Modem<S, C, W, P>) -> NetworkState
    where
        S: SerialLink,
        C: Clock,
        W: Watchdog,
        P: PowerKey,
    {
        match self.state {
            NetworkState::Booting => {
                info!("Network bring-up");
                self.attempt(modem);
            }
            NetworkState::Offline => {
                let since = modem.now_ms().saturating_sub(self.last_attempt_ms);
                if since >= self.reconnect_interval_ms {
                    info!("Reconnect attempt");
                    self.attempt(modem);
                }
            }
            NetworkState::Online => {}
        }
        self.state
    }

    /// Record a failure reported by the telemetry or TCP layer
    pub fn mark_offline(&mut self, now_ms: u64) {
        if self.state != NetworkState::Offline {
            info!("Network marked offline");
        }
        self.state = NetworkState::Offline;
        self.last_attempt_ms = now_ms;
    }

    /// Re-enter the boot sequence, e.g. after a modem power cycle
    pub fn restart(&mut self) {
        info!("Network state reset to booting");
        self.state = NetworkState::Booting;
    }

    /// Power up the GNSS engine once the network is online.
    ///
    /// A failure tears the data context down and rebuilds it for one more
    /// try; a second failure power-cycles the modem and returns to Booting.
    pub fn enable_gnss<S, C, W, P>(&mut self, modem: &mut Modem<S, C, W, P>) -> GnssOutcome
    where
        S: SerialLink,
        C: Clock,
        W: Watchdog,
        P: PowerKey,
    {
        if self.state != NetworkState::Online {
            return GnssOutcome::NotOnline;
        }
        if modem.set_gnss_power(true, &self.profile) {
            return GnssOutcome::Enabled;
        }

        warn!("GNSS power-up failed, rebuilding data context");
        modem.close_data_stack(&self.profile);
        let rebuilt = modem.open_data_stack(&self.profile);
        if rebuilt && modem.set_gnss_power(true, &self.profile) {
            return GnssOutcome::Enabled;
        }

        warn!("GNSS still unavailable, escalating to modem reset");
        modem.power_cycle();
        self.restart();
        GnssOutcome::Escalated
    }

    /// Power the GNSS engine down; never escalates
    pub fn disable_gnss<S, C, W, P>(&mut self, modem: &mut Modem<S, C, W, P>) -> bool
    where
        S: SerialLink,
        C: Clock,
        W: Watchdog,
        P: PowerKey,
    {
        modem.set_gnss_power(false, &self.profile)
    }

    fn attempt<S, C, W, P>(&mut self, modem: &mut Modem<S, C, W, P>)
    where
        S: SerialLink,
        C: Clock,
        W: Watchdog,
        P: PowerKey,
    {
        match modem.bring_up(&self.profile) {
            Ok(()) => {
                info!("Connected to network");
                self.state = NetworkState::Online;
            }
            Err(step) => {
                warn!("Bring-up failed at {:?}, going offline", step);
                self.state = NetworkState::Offline;
                self.last_attempt_ms = modem.now_ms();
            }
        }
    }
}

#[cfg(test)]
pub mod fixtures {
    use crate::modem::mocks::Rig;

    /// Replies for a modem that comes up cleanly on the SIM7000 path
    pub fn healthy_network(rig: &Rig) {
        let s = &rig.script;
        s.respond("AT", "\r\nOK\r\n");
        s.respond("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
        s.respond("AT+CSQ", "\r\n+CSQ: 18,99\r\n\r\nOK\r\n");
        s.respond("AT+COPS?", "\r\n+COPS: 0,0,\"Onomondo\",7\r\n\r\nOK\r\n");
        s.respond("AT+CREG?", "\r\n+CREG: 0,5\r\n\r\nOK\r\n");
        s.respond("AT+CEREG?", "\r\n+CEREG: 0,2\r\n\r\nOK\r\n");
        s.respond("AT+CIPSHUT", "\r\nSHUT OK\r\n");
        s.respond("AT+CIFSR", "\r\n10.170.3.4\r\n");
        s.respond("AT+CNACT=0,1", "\r\nOK\r\n\r\n+APP PDP: 0,ACTIVE\r\n");
        s.respond("AT+NETOPEN", "\r\nOK\r\n\r\n+NETOPEN: 0\r\n");
        s.respond("AT+NETCLOSE", "\r\nOK\r\n\r\n+NETCLOSE: 0\r\n");
    }
}
